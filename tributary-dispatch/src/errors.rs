use thiserror::Error;
use tributary_core::broker::BrokerError;
use tributary_core::topology::SpecError;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("publish failed after {attempts} attempts: {source}")]
    PublishFailed { attempts: usize, source: BrokerError },

    #[error("drain timeout: {0} messages still in flight")]
    DrainTimeout(usize),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl DispatchError {
    /// Transient failures are retried by the owning component; the rest are
    /// terminal for the call that produced them.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Connection(_) => true,
            DispatchError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Abandoned in-flight count carried by a drain timeout, if any.
    pub fn abandoned_in_flight(&self) -> Option<usize> {
        match self {
            DispatchError::DrainTimeout(count) => Some(*count),
            _ => None,
        }
    }
}
