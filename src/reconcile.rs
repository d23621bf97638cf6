//! The reconciliation decision.
//!
//! [`reconcile`] is a pure function of the desired list, the inventory
//! snapshot and the registry digests resolved for this pass. It performs no
//! I/O and cannot fail, so it is tested without any runtime.
//!
//! Every name lands in at most one bucket:
//!
//! ```text
//!   desired, not running   -> create
//!   running, not desired   -> remove
//!   desired and running    -> update (if env changed or image stale) / nothing
//! ```
//!
//! Matching is by container name, not slug: a rename is a remove of the old
//! name plus a create of the new one.

use std::collections::HashSet;

use crate::models::{
    DesiredContainer, Digest, Inventory, ReconciliationDecision, RegistryDigests,
    RuntimeContainerSnapshot,
};
use crate::registry::StalenessPolicy;

/// Why a running container needs to be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    EnvironmentChanged,
    ImageStale,
}

/// Compute the create/update/remove sets for one pass.
///
/// If `desired` names a container more than once, the first entry wins.
pub fn reconcile(
    desired: &[DesiredContainer],
    inventory: &Inventory,
    registry: &RegistryDigests,
    policy: StalenessPolicy,
) -> ReconciliationDecision {
    let mut decision = ReconciliationDecision::default();
    let mut declared: HashSet<&str> = HashSet::with_capacity(desired.len());

    for spec in desired {
        if !declared.insert(spec.name()) {
            continue;
        }

        match inventory.get(spec.name()) {
            None => decision.create.push(spec.clone()),
            Some(running) => {
                let registry_digest = registry.get(spec.image()).and_then(Option::as_ref);
                if update_reason(spec, running, registry_digest, policy).is_some() {
                    decision.update.push(spec.clone());
                }
            }
        }
    }

    decision.remove = inventory
        .keys()
        .filter(|name| !declared.contains(name.as_str()))
        .cloned()
        .collect();

    decision
}

/// Reason `running` must be recreated to match `spec`, if any.
pub fn update_reason(
    spec: &DesiredContainer,
    running: &RuntimeContainerSnapshot,
    registry_digest: Option<&Digest>,
    policy: StalenessPolicy,
) -> Option<UpdateReason> {
    if env_changed(spec, running) {
        return Some(UpdateReason::EnvironmentChanged);
    }
    if policy.is_stale(running.local_image_digest.as_ref(), registry_digest) {
        return Some(UpdateReason::ImageStale);
    }
    None
}

/// True if some desired entry is missing from the running environment.
///
/// Extra variables on the running container (injected by the image or the
/// runtime) are ignored.
pub fn env_changed(spec: &DesiredContainer, running: &RuntimeContainerSnapshot) -> bool {
    spec.environment().iter().any(|e| !running.env.contains(e))
}

/// Names declared more than once in `desired`.
pub fn duplicate_names(desired: &[DesiredContainer]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for spec in desired {
        if !seen.insert(spec.name()) && !duplicates.contains(&spec.name()) {
            duplicates.push(spec.name());
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn running(name: &str, image: &str, env: &[&str], digest: Option<&str>) -> RuntimeContainerSnapshot {
        RuntimeContainerSnapshot {
            name: name.to_string(),
            image_tag: image.to_string(),
            env: env.iter().map(|e| e.to_string()).collect(),
            local_image_digest: digest.and_then(Digest::new),
        }
    }

    fn inventory(entries: Vec<RuntimeContainerSnapshot>) -> Inventory {
        entries.into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    fn digests(entries: &[(&str, Option<&str>)]) -> RegistryDigests {
        entries
            .iter()
            .map(|(image, digest)| (image.to_string(), digest.and_then(Digest::new)))
            .collect()
    }

    fn names(decision: &ReconciliationDecision) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
        (
            decision.create_names(),
            decision.update_names(),
            decision.remove.iter().map(String::as_str).collect(),
        )
    }

    #[test]
    fn test_create_when_nothing_runs() {
        let desired = vec![DesiredContainer::new("web", "web", "img:latest")];
        let decision = reconcile(
            &desired,
            &Inventory::new(),
            &RegistryDigests::new(),
            StalenessPolicy::Conservative,
        );
        assert_eq!(names(&decision), (vec!["web"], vec![], vec![]));
    }

    #[test]
    fn test_remove_everything_not_desired() {
        let inv = inventory(vec![
            running("x", "a:1", &[], None),
            running("y", "b:1", &[], None),
        ]);
        let decision = reconcile(&[], &inv, &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert_eq!(names(&decision), (vec![], vec![], vec!["x", "y"]));
    }

    #[test]
    fn test_extra_running_env_does_not_trigger_update() {
        let desired = vec![DesiredContainer::new("s", "web", "img:1").with_env(&["A=1"])];
        let inv = inventory(vec![running("web", "img:1", &["A=1", "B=2"], None)]);
        let decision = reconcile(&desired, &inv, &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert!(decision.is_empty());
    }

    #[test]
    fn test_missing_desired_env_triggers_update() {
        let desired = vec![DesiredContainer::new("s", "web", "img:1").with_env(&["A=1", "C=3"])];
        let inv = inventory(vec![running("web", "img:1", &["A=1"], None)]);
        let decision = reconcile(&desired, &inv, &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert_eq!(names(&decision), (vec![], vec!["web"], vec![]));
        assert_eq!(
            update_reason(&desired[0], &inv["web"], None, StalenessPolicy::Conservative),
            Some(UpdateReason::EnvironmentChanged)
        );
    }

    #[test]
    fn test_changed_env_value_triggers_update() {
        let desired = vec![DesiredContainer::new("s", "web", "img:1").with_env(&["A=2"])];
        let inv = inventory(vec![running("web", "img:1", &["A=1"], None)]);
        let decision = reconcile(&desired, &inv, &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert_eq!(decision.update_names(), vec!["web"]);
    }

    #[test]
    fn test_stale_digest_triggers_update() {
        let desired = vec![DesiredContainer::new("s", "web", "img:1")];
        let inv = inventory(vec![running("web", "img:1", &[], Some("sha256:old"))]);
        let registry = digests(&[("img:1", Some("sha256:new"))]);

        let decision = reconcile(&desired, &inv, &registry, StalenessPolicy::Conservative);
        assert_eq!(decision.update_names(), vec!["web"]);
        assert_eq!(
            update_reason(
                &desired[0],
                &inv["web"],
                registry["img:1"].as_ref(),
                StalenessPolicy::Conservative
            ),
            Some(UpdateReason::ImageStale)
        );
    }

    #[test]
    fn test_matching_digest_is_fresh() {
        let desired = vec![DesiredContainer::new("s", "web", "img:1")];
        let inv = inventory(vec![running("web", "img:1", &[], Some("sha256:same"))]);
        let registry = digests(&[("img:1", Some("sha256:same"))]);

        let decision = reconcile(&desired, &inv, &registry, StalenessPolicy::Conservative);
        assert!(decision.is_empty());
    }

    #[test]
    fn test_unresolved_digests_are_not_stale_by_default() {
        let desired = vec![
            DesiredContainer::new("a", "no-local", "img:1"),
            DesiredContainer::new("b", "no-registry", "img:2"),
        ];
        let inv = inventory(vec![
            running("no-local", "img:1", &[], None),
            running("no-registry", "img:2", &[], Some("sha256:aa")),
        ]);
        let registry = digests(&[("img:1", Some("sha256:aa")), ("img:2", None)]);

        let conservative = reconcile(&desired, &inv, &registry, StalenessPolicy::Conservative);
        assert!(conservative.is_empty());

        let strict = reconcile(&desired, &inv, &registry, StalenessPolicy::AssumeStale);
        assert_eq!(strict.update_names(), vec!["no-local", "no-registry"]);
    }

    #[test]
    fn test_rename_is_remove_plus_create() {
        let desired = vec![DesiredContainer::new("web", "web-v2", "img:1")];
        let inv = inventory(vec![running("web-v1", "img:1", &[], None)]);
        let decision = reconcile(&desired, &inv, &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert_eq!(names(&decision), (vec!["web-v2"], vec![], vec!["web-v1"]));
    }

    #[test]
    fn test_buckets_are_disjoint() {
        let desired = vec![
            DesiredContainer::new("a", "new", "img:1"),
            DesiredContainer::new("b", "changed", "img:1").with_env(&["X=1"]),
            DesiredContainer::new("c", "same", "img:1"),
            DesiredContainer::new("d", "stale", "img:2"),
            DesiredContainer::new("a2", "new", "img:9"),
        ];
        let inv = inventory(vec![
            running("changed", "img:1", &[], None),
            running("same", "img:1", &[], Some("sha256:1")),
            running("stale", "img:2", &[], Some("sha256:old")),
            running("orphan", "img:3", &[], None),
        ]);
        let registry = digests(&[("img:1", Some("sha256:1")), ("img:2", Some("sha256:new"))]);

        for policy in [StalenessPolicy::Conservative, StalenessPolicy::AssumeStale] {
            let decision = reconcile(&desired, &inv, &registry, policy);
            let (create, update, remove) = names(&decision);

            let mut all: Vec<&str> = create.iter().chain(&update).chain(&remove).copied().collect();
            let total = all.len();
            all.sort_unstable();
            all.dedup();
            assert_eq!(all.len(), total, "a name appeared in two buckets");

            assert_eq!(create, vec!["new"]);
            assert_eq!(remove, vec!["orphan"]);
            assert!(update.contains(&"changed"));
            assert!(update.contains(&"stale"));
            assert!(!update.contains(&"same"));
        }
    }

    #[test]
    fn test_idempotent_after_apply() {
        let desired = vec![
            DesiredContainer::new("w", "web", "img:1").with_env(&["A=1"]),
            DesiredContainer::new("d", "db", "pg:16").with_env(&["PW=x"]),
        ];
        let registry = digests(&[("img:1", Some("sha256:w")), ("pg:16", Some("sha256:d"))]);
        let first = reconcile(
            &desired,
            &inventory(vec![running("db", "pg:16", &[], Some("sha256:d"))]),
            &registry,
            StalenessPolicy::Conservative,
        );
        assert_eq!(first.create_names(), vec!["web"]);
        assert_eq!(first.update_names(), vec!["db"]);

        // Inventory after applying: both containers recreated as desired.
        let applied = inventory(vec![
            running("web", "img:1", &["A=1", "PATH=/bin"], Some("sha256:w")),
            running("db", "pg:16", &["PW=x"], Some("sha256:d")),
        ]);
        let second = reconcile(&desired, &applied, &registry, StalenessPolicy::Conservative);
        assert!(second.is_empty());
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let desired = vec![
            DesiredContainer::new("one", "web", "img:1"),
            DesiredContainer::new("two", "web", "img:2"),
        ];
        let decision = reconcile(&desired, &Inventory::new(), &RegistryDigests::new(), StalenessPolicy::Conservative);
        assert_eq!(decision.create.len(), 1);
        assert_eq!(decision.create[0].slug, "one");
        assert_eq!(duplicate_names(&desired), vec!["web"]);
    }
}
