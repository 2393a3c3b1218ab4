use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// A message delivered from a stream to one queue-group member.
///
/// The broker owns the message until it is handed to a dispatcher; from that
/// point the dispatcher invocation owns the acknowledgement responsibility
/// until it reports an [`Outcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    // subject the message was published under
    pub subject: String,
    // the actual payload of the message
    pub payload: Vec<u8>,
    // stream sequence number, monotonic per stream
    pub sequence: u64,
    // delivery attempt, starts at 1 and increments on each redelivery
    pub attempt: u32,
    // timestamp for when the message was accepted by the broker
    pub publish_time: u64,
    // user-defined properties/attributes
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject:_{}_sequence:_{}_attempt:_{}",
            self.subject, self.sequence, self.attempt
        )
    }
}

/// Verdict returned by a handler for one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Remove the message from the broker's pending set permanently.
    Ack,
    /// Request redelivery. With no explicit delay the consumer's backoff
    /// ladder decides when the next attempt happens.
    Nak { retry_after: Option<Duration> },
    /// Mark the message permanently failed. Routed to the dead-letter
    /// subject when one is configured, never silently discarded.
    Term { reason: String },
}

impl Outcome {
    pub fn nak() -> Self {
        Outcome::Nak { retry_after: None }
    }

    pub fn nak_after(delay: Duration) -> Self {
        Outcome::Nak {
            retry_after: Some(delay),
        }
    }

    pub fn term(reason: impl Into<String>) -> Self {
        Outcome::Term {
            reason: reason.into(),
        }
    }
}

/// Confirmation of durable acceptance by the broker, not just transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    // subject the message was accepted under
    pub subject: String,
    // broker-assigned stream sequence number
    pub sequence: u64,
}
