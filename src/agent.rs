//! One reconciliation pass, and the loop that repeats it.
//!
//! A pass fetches the desired state, snapshots the host, resolves registry
//! digests for containers that are already running, computes the decision
//! and applies it: removals first, then creates, then updates. A failed
//! action is logged and counted and the pass moves on to the next one.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{ActionError, PassError};
use crate::executor::LifecycleExecutor;
use crate::inventory::ContainerInventory;
use crate::management::DesiredStateSource;
use crate::models::{
    DesiredContainer, Digest, Inventory, ReconciliationDecision, RegistryDigests,
};
use crate::reconcile::{duplicate_names, reconcile};
use crate::registry::{CredentialScope, ImageDigestResolver, RegistryCredentialStore};
use crate::runtime::{ContainerRuntime, bounded};

/// Result of a single pass.
#[derive(Debug)]
pub enum PassOutcome {
    /// The desired state was unavailable or empty; nothing was touched.
    Skipped,
    Completed(PassReport),
}

/// What a completed pass planned and how much of it succeeded.
#[derive(Debug, Default)]
pub struct PassReport {
    pub decision: ReconciliationDecision,
    pub applied: usize,
    pub failed: usize,
}

pub struct Agent {
    config: AgentConfig,
    source: Arc<dyn DesiredStateSource>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<RegistryCredentialStore>,
    resolver: ImageDigestResolver,
    inventory: ContainerInventory,
    executor: LifecycleExecutor,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn DesiredStateSource>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let timeout = config.runtime_timeout;
        let credentials = Arc::new(RegistryCredentialStore::new());
        let resolver = ImageDigestResolver::new(runtime.clone(), timeout);
        let inventory = ContainerInventory::new(runtime.clone(), resolver.clone(), timeout);
        let executor = LifecycleExecutor::new(runtime.clone(), credentials.clone(), timeout)
            .with_pull_timeout(config.pull_timeout);

        Self {
            config,
            source,
            runtime,
            credentials,
            resolver,
            inventory,
            executor,
        }
    }

    /// Run passes until `shutdown` resolves.
    ///
    /// Shutdown is only observed between passes, so a pass in progress
    /// always finishes its remaining actions.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            agent = %self.config.name,
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation loop"
        );

        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.run_pass().await {
                tracing::error!(error = %e, "Reconciliation pass failed");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping reconciliation loop");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Fetch, decide and apply once.
    pub async fn run_pass(&self) -> Result<PassOutcome, PassError> {
        let span = tracing::info_span!("pass", id = %Uuid::new_v4());
        async {
            tracing::info!("Reconciliation pass started");

            let Some(decision) = self.decide(self.config.prune_stopped).await? else {
                return Ok(PassOutcome::Skipped);
            };

            let report = self.apply(decision).await;
            tracing::info!(
                applied = report.applied,
                failed = report.failed,
                "Reconciliation pass finished"
            );
            Ok(PassOutcome::Completed(report))
        }
        .instrument(span)
        .await
    }

    /// Compute the decision for the current state without applying it.
    ///
    /// Returns `None` when the pass would be skipped.
    pub async fn plan(&self) -> Result<Option<ReconciliationDecision>, PassError> {
        let span = tracing::info_span!("plan", id = %Uuid::new_v4());
        self.decide(false).instrument(span).await
    }

    async fn decide(&self, prune: bool) -> Result<Option<ReconciliationDecision>, PassError> {
        let desired = match self.source.fetch().await {
            Ok(desired) => desired,
            Err(e) => {
                tracing::warn!(error = %e, "Desired state unavailable, skipping pass");
                return Ok(None);
            }
        };
        if desired.is_empty() {
            tracing::warn!("Desired state is empty, skipping pass");
            return Ok(None);
        }
        tracing::info!(containers = desired.len(), "Desired state fetched");

        for name in duplicate_names(&desired) {
            tracing::warn!(container = %name, "Container declared more than once, using the first entry");
        }

        if prune {
            self.prune_stopped().await;
        }

        let inventory = self
            .inventory
            .snapshot(&self.config.name)
            .await
            .map_err(PassError::Inventory)?;

        let registry = self.resolve_registry_digests(&desired, &inventory).await;
        let decision = reconcile(&desired, &inventory, &registry, self.config.staleness);

        tracing::info!(
            create = decision.create.len(),
            update = decision.update.len(),
            remove = decision.remove.len(),
            "Reconciliation planned"
        );
        Ok(Some(decision))
    }

    async fn prune_stopped(&self) {
        let timeout = self.config.runtime_timeout;
        if let Err(e) = bounded(timeout, "prune containers", self.runtime.prune_containers()).await {
            tracing::warn!(error = %e, "Failed to prune stopped containers");
        }
    }

    /// Registry digests for every desired image that already has a running
    /// container. Images that only appear in creates are pulled anyway.
    async fn resolve_registry_digests(
        &self,
        desired: &[DesiredContainer],
        inventory: &Inventory,
    ) -> RegistryDigests {
        let mut digests = RegistryDigests::new();
        let mut seen = HashSet::new();

        for spec in desired {
            if !seen.insert(spec.name())
                || !inventory.contains_key(spec.name())
                || digests.contains_key(spec.image())
            {
                continue;
            }

            let scope = self.credentials.acquire(spec.auth.as_ref()).await;
            let digest = self.lookup_registry_digest(&scope, spec.image()).await;
            drop(scope);

            tracing::debug!(
                image = %spec.image(),
                digest = ?digest.as_ref().map(|d| d.as_str()),
                "Resolved registry digest"
            );
            digests.insert(spec.image().to_string(), digest);
        }

        digests
    }

    /// Try the scope's credentials in the same order a login would, so an
    /// image that can be pulled can also be checked for updates.
    async fn lookup_registry_digest(
        &self,
        scope: &CredentialScope<'_>,
        image: &str,
    ) -> Option<Digest> {
        if scope.is_empty() {
            return self.resolver.registry_digest(image, None).await;
        }
        for credential in scope.candidates(image) {
            if let Some(digest) = self.resolver.registry_digest(image, Some(credential)).await {
                return Some(digest);
            }
        }
        None
    }

    async fn apply(&self, decision: ReconciliationDecision) -> PassReport {
        let mut report = PassReport::default();

        for name in &decision.remove {
            report.record(self.executor.remove(name).await);
        }
        for spec in &decision.create {
            report.record(self.executor.create(spec).await);
        }
        for spec in &decision.update {
            report.record(self.executor.update(spec).await);
        }

        report.decision = decision;
        report
    }
}

/// Future that resolves on ctrl-c or, on unix, SIGTERM (what `docker stop`
/// sends).
///
/// The SIGTERM handler is installed before this returns, so a signal that
/// arrives before the future is first polled is not lost.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received ctrl-c"),
            _ = terminate => tracing::info!("Received SIGTERM"),
        }
    })
}

impl PassReport {
    fn record(&mut self, result: Result<(), ActionError>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation action failed");
                self.failed += 1;
            }
        }
    }
}
