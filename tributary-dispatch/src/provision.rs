use crate::connection::ConnectionManager;
use crate::errors::{DispatchError, Result};

use std::sync::Arc;
use tributary_core::broker::{BrokerError, EnsureOutcome};
use tributary_core::topology::{ConsumerSpec, StreamSpec};
use tracing::{info, warn};

/// Idempotent topology setup. Service instances start concurrently and race
/// to provision the same streams and consumers; "already exists with a
/// matching spec" is success, "already exists with a differing spec" is a
/// reported conflict the caller may escalate.
#[derive(Debug, Clone)]
pub struct TopologyProvisioner {
    manager: Arc<ConnectionManager>,
}

impl TopologyProvisioner {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        TopologyProvisioner { manager }
    }

    pub async fn ensure_stream(&self, spec: &StreamSpec) -> Result<EnsureOutcome> {
        spec.validate()?;
        let conn = self.manager.current().await?;
        match conn.ensure_stream(spec).await {
            Ok(EnsureOutcome::Created) => {
                info!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
                Ok(EnsureOutcome::Created)
            }
            Ok(EnsureOutcome::AlreadyExists) => Ok(EnsureOutcome::AlreadyExists),
            Err(BrokerError::Conflict(reason)) => {
                warn!(stream = %spec.name, %reason, "stream exists with incompatible configuration");
                Err(DispatchError::TopologyConflict(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<EnsureOutcome> {
        spec.validate()?;
        let conn = self.manager.current().await?;
        match conn.ensure_consumer(spec).await {
            Ok(EnsureOutcome::Created) => {
                info!(
                    stream = %spec.stream,
                    durable = %spec.durable_name,
                    queue_group = %spec.queue_group,
                    "durable consumer created"
                );
                Ok(EnsureOutcome::Created)
            }
            Ok(EnsureOutcome::AlreadyExists) => Ok(EnsureOutcome::AlreadyExists),
            Err(BrokerError::Conflict(reason)) => {
                warn!(
                    stream = %spec.stream,
                    durable = %spec.durable_name,
                    %reason,
                    "durable consumer exists with incompatible configuration"
                );
                Err(DispatchError::TopologyConflict(reason))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "provision_test.rs"]
mod provision_test;
