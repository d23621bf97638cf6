//! Snapshot of the containers present on the host.

use std::sync::Arc;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::models::{Inventory, RuntimeContainerSnapshot};
use crate::registry::ImageDigestResolver;
use crate::runtime::{ContainerRuntime, bounded};

/// Read-only view of the host's containers, taken fresh every pass.
pub struct ContainerInventory {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: ImageDigestResolver,
    timeout: Duration,
}

impl ContainerInventory {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: ImageDigestResolver,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            resolver,
            timeout,
        }
    }

    /// Snapshot every container except `exclude_name` (the agent itself).
    ///
    /// A listing failure is returned as an error rather than an empty
    /// snapshot, which would read as "nothing running" and remove everything.
    pub async fn snapshot(&self, exclude_name: &str) -> Result<Inventory, RuntimeError> {
        let records = bounded(
            self.timeout,
            "list containers",
            self.runtime.list_containers(),
        )
        .await?;

        let mut inventory = Inventory::new();
        for record in records {
            if record.name == exclude_name {
                continue;
            }

            let lookup = if record.image_id.is_empty() {
                &record.image
            } else {
                &record.image_id
            };
            let local_image_digest = self.resolver.local_digest_for(lookup, &record.image).await;

            inventory.insert(
                record.name.clone(),
                RuntimeContainerSnapshot {
                    name: record.name,
                    image_tag: record.image,
                    env: record.env.into_iter().collect(),
                    local_image_digest,
                },
            );
        }

        tracing::debug!(containers = inventory.len(), "Inventory snapshot taken");
        Ok(inventory)
    }
}
