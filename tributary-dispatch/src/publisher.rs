use crate::connection::ConnectionManager;
use crate::errors::{DispatchError, Result};
use crate::retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use tributary_core::broker::BrokerError;
use tributary_core::message::DeliveryReceipt;
use tracing::{error, warn};

/// Configuration options for publishers
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    // Maximum number of retries for transient publish failures
    pub max_retries: usize,
    // Base backoff in milliseconds
    pub base_backoff_ms: u64,
    // Maximum backoff cap in milliseconds
    pub max_backoff_ms: u64,
}

/// Publishes messages with durable delivery confirmation.
///
/// Transient failures (broker unavailable, timeout, lost session) are
/// retried with jittered backoff up to the configured bound; validation
/// failures surface immediately. Safe to call concurrently from `&self`;
/// receipt ordering reflects broker-assigned sequence, not call order.
#[derive(Debug, Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    options: PublisherOptions,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>, options: PublisherOptions) -> Self {
        Publisher { manager, options }
    }

    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<DeliveryReceipt> {
        self.publish_with_attributes(subject, payload, None).await
    }

    pub async fn publish_with_attributes(
        &self,
        subject: &str,
        payload: &[u8],
        attributes: Option<HashMap<String, String>>,
    ) -> Result<DeliveryReceipt> {
        if subject.is_empty() {
            return Err(DispatchError::PublishRejected(
                "subject must not be empty".to_string(),
            ));
        }

        let retry = RetryPolicy::new(
            self.options.max_retries,
            self.options.base_backoff_ms,
            self.options.max_backoff_ms,
        );

        let mut attempts = 0;
        loop {
            let conn = self.manager.current().await?;
            match conn.publish(subject, payload, attributes.clone()).await {
                Ok(sequence) => {
                    return Ok(DeliveryReceipt {
                        subject: subject.to_string(),
                        sequence,
                    })
                }
                Err(e @ BrokerError::InvalidSubject(_))
                | Err(e @ BrokerError::PayloadTooLarge(_)) => {
                    error!(subject, error = %e, "publish rejected by broker");
                    return Err(DispatchError::PublishRejected(e.to_string()));
                }
                Err(e) if e.is_transient() => {
                    if matches!(e, BrokerError::ConnectionClosed | BrokerError::Unavailable(_)) {
                        self.manager.invalidate().await;
                    }
                    attempts += 1;
                    if attempts > retry.max_retries() {
                        return Err(DispatchError::PublishFailed {
                            attempts,
                            source: e,
                        });
                    }
                    let backoff = retry.calculate_backoff(attempts - 1);
                    warn!(subject, error = %e, attempt = attempts, "transient publish failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(subject, error = %e, "non-retryable error in publish");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "publisher_test.rs"]
mod publisher_test;
