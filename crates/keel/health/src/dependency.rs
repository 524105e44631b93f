//! Dependency gate
//!
//! Waits until every declared dependency reports readiness in the registry.
//! Dependencies are checked in order; each gets its own deadline.

use keel_registry::ContainerRegistry;
use keel_types::{ContainerKey, DependencySpec};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backoff::{retry_within, BackoffConfig};
use crate::error::{HealthError, Result};
use crate::progress::{Outcome, Reporter};

pub struct DependencyGate {
    registry: Arc<ContainerRegistry>,
    backoff: BackoffConfig,
}

impl DependencyGate {
    pub fn new(registry: Arc<ContainerRegistry>, backoff: BackoffConfig) -> Self {
        Self { registry, backoff }
    }

    /// Wait for `dependencies`, streaming progress through `reporter`.
    ///
    /// Sends exactly one `SUCCESS` or `FAILED`, unless the reporter's token is
    /// cancelled first.
    pub async fn ready(&self, reporter: Reporter, dependencies: &[DependencySpec]) -> Outcome {
        let result = self.wait_all(&reporter, dependencies).await;

        match &result {
            Ok(()) => info!(container = %reporter.key(), "Dependencies solved"),
            Err(HealthError::Cancelled) => debug!(container = %reporter.key(), "Dependency wait cancelled"),
            Err(err) => warn!(container = %reporter.key(), error = %err, "Dependencies failed"),
        }

        reporter.finish(result).await
    }

    async fn wait_all(&self, reporter: &Reporter, dependencies: &[DependencySpec]) -> Result<()> {
        for dependency in dependencies {
            if reporter.is_cancelled() {
                return Err(HealthError::Cancelled);
            }

            debug!(
                container = %reporter.key(),
                group = %dependency.group,
                name = %dependency.name,
                "Waiting for dependency"
            );

            let own = reporter.key();
            retry_within(reporter, self.backoff, dependency.timeout(), move || {
                std::future::ready(self.solve(own, dependency))
            })
            .await?;
        }
        Ok(())
    }

    fn solve(&self, own: &ContainerKey, dependency: &DependencySpec) -> Result<()> {
        if dependency.is_wildcard() {
            let members: Vec<_> = self
                .registry
                .find_group(&dependency.group)
                .into_iter()
                .filter(|entry| &entry.key() != own)
                .collect();

            if members.is_empty() {
                return Err(HealthError::DependencyNotFound {
                    group: dependency.group.clone(),
                    name: dependency.name.clone(),
                });
            }

            return match members.iter().find(|entry| !entry.is_ready()) {
                Some(entry) => Err(HealthError::DependencyNotReady(entry.key().to_string())),
                None => Ok(()),
            };
        }

        match self.registry.find(&dependency.group, &dependency.name) {
            Some(entry) if entry.is_ready() => Ok(()),
            Some(entry) => Err(HealthError::DependencyNotReady(entry.key().to_string())),
            None => Err(HealthError::DependencyNotFound {
                group: dependency.group.clone(),
                name: dependency.name.clone(),
            }),
        }
    }
}
