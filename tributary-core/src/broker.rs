use crate::message::Message;
use crate::topology::{ConsumerSpec, StreamSpec};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown subject: {0}")]
    InvalidSubject(String),

    #[error("payload exceeds broker limit: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("topology conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Transient errors are worth retrying; everything else is terminal for
    /// the call that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::Timeout(_) | BrokerError::ConnectionClosed
        )
    }
}

/// Username/password pair for broker authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Result of an idempotent ensure operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// Dialer for broker sessions, one per transport kind. The dispatch core
/// never speaks a wire protocol itself; it goes through this seam.
#[async_trait]
pub trait BrokerTransport: Send + Sync + Debug {
    async fn connect(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// A live session with the broker, shared read-only by publishers and
/// dispatchers.
#[async_trait]
pub trait BrokerConnection: Send + Sync + Debug {
    /// Publish with durable confirmation. The returned sequence number
    /// proves acceptance into the stream, not just transmission.
    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        attributes: Option<HashMap<String, String>>,
    ) -> BrokerResult<u64>;

    async fn ensure_stream(&self, spec: &StreamSpec) -> BrokerResult<EnsureOutcome>;

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> BrokerResult<EnsureOutcome>;

    /// Pull up to `max_messages` for one queue-group member. Each returned
    /// message is leased to the caller until ack/nak/term or ack_wait
    /// expiry, whichever comes first.
    async fn fetch(
        &self,
        stream: &str,
        durable_name: &str,
        member: &str,
        max_messages: usize,
    ) -> BrokerResult<Vec<Message>>;

    async fn ack(&self, stream: &str, durable_name: &str, sequence: u64) -> BrokerResult<()>;

    /// Negative-acknowledge; the broker schedules redelivery after `delay`.
    async fn nak(
        &self,
        stream: &str,
        durable_name: &str,
        sequence: u64,
        delay: Duration,
    ) -> BrokerResult<()>;

    /// Terminally reject; the message is never redelivered.
    async fn term(&self, stream: &str, durable_name: &str, sequence: u64) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}
