use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Default window the broker waits for an acknowledgement before a leased
/// message becomes eligible for redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
/// Default bound on delivery attempts before a message is terminated.
pub const DEFAULT_MAX_DELIVER: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid stream spec: {0}")]
    InvalidStream(String),

    #[error("invalid consumer spec: {0}")]
    InvalidConsumer(String),
}

/// How long the broker retains messages in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RetentionPolicy {
    #[serde(rename = "size_bounded")]
    SizeBounded { max_bytes: u64 },
    #[serde(rename = "age_bounded")]
    AgeBounded { max_age: Duration },
    #[serde(rename = "unbounded")]
    Unbounded,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Unbounded
    }
}

/// Storage durability for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "disk")]
    Disk,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::Disk => write!(f, "disk"),
        }
    }
}

/// Acknowledgement policy for a consumer.
///
/// Variants:
/// - `Explicit`: every delivered message must be ack/nak/term'd by the
///   consumer, redelivery on silence.
/// - `None`: delivery is fire-and-forget, no redelivery tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPolicy {
    #[serde(rename = "explicit")]
    Explicit,
    #[serde(rename = "none")]
    None,
}

/// Describes a durably stored, ordered sequence of messages published under
/// one or more subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    // stream name, globally unique per broker
    pub name: String,
    // ordered subject patterns captured by the stream, never empty
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageKind,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        StreamSpec {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::default(),
            storage: StorageKind::Disk,
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::InvalidStream("stream name is empty".into()));
        }
        if self.subjects.is_empty() {
            return Err(SpecError::InvalidStream(format!(
                "stream {} has no subjects",
                self.name
            )));
        }
        if self.subjects.iter().any(|s| s.is_empty()) {
            return Err(SpecError::InvalidStream(format!(
                "stream {} has an empty subject pattern",
                self.name
            )));
        }
        Ok(())
    }

    /// Two specs of the same name are compatible when their subject sets
    /// match. A differing subject set is a configuration conflict, not a
    /// silent merge.
    pub fn compatible_with(&self, existing: &StreamSpec) -> bool {
        self.subjects == existing.subjects
    }
}

/// Describes a named durable cursor over a stream, shared by the members of
/// a queue group. Instances using the same queue group compete for messages;
/// each message is delivered to exactly one member per delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    // durable name, unique within the bound stream
    pub durable_name: String,
    // queue group shared by competing dispatcher instances
    pub queue_group: String,
    // name of the stream this consumer is bound to
    pub stream: String,
    pub ack_policy: AckPolicy,
    // upper bound on concurrently outstanding deliveries per member
    pub max_in_flight: usize,
    // ordered redelivery delays, indexed by delivery attempt
    pub backoff: Vec<Duration>,
    // how long a leased message may stay unacknowledged before redelivery
    pub ack_wait: Duration,
    // delivery attempts after which the message is terminated
    pub max_deliver: usize,
}

impl ConsumerSpec {
    pub fn new(
        durable_name: impl Into<String>,
        queue_group: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        ConsumerSpec {
            durable_name: durable_name.into(),
            queue_group: queue_group.into(),
            stream: stream.into(),
            ack_policy: AckPolicy::Explicit,
            max_in_flight: 1,
            backoff: Vec::new(),
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: DEFAULT_MAX_DELIVER,
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.durable_name.is_empty() {
            return Err(SpecError::InvalidConsumer("durable name is empty".into()));
        }
        if self.queue_group.is_empty() {
            return Err(SpecError::InvalidConsumer(format!(
                "consumer {} has no queue group",
                self.durable_name
            )));
        }
        if self.stream.is_empty() {
            return Err(SpecError::InvalidConsumer(format!(
                "consumer {} is not bound to a stream",
                self.durable_name
            )));
        }
        if self.max_in_flight == 0 {
            return Err(SpecError::InvalidConsumer(format!(
                "consumer {} max_in_flight must be positive",
                self.durable_name
            )));
        }
        if self.max_deliver == 0 {
            return Err(SpecError::InvalidConsumer(format!(
                "consumer {} max_deliver must be positive",
                self.durable_name
            )));
        }
        Ok(())
    }

    /// A durable-name collision is only acceptable when the whole config
    /// matches.
    pub fn compatible_with(&self, existing: &ConsumerSpec) -> bool {
        self == existing
    }

    /// Redelivery delay for the given delivery attempt, saturating on the
    /// last ladder entry. An empty ladder means immediate redelivery.
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        match self.backoff.as_slice() {
            [] => Duration::ZERO,
            ladder => {
                let idx = (attempt.saturating_sub(1) as usize).min(ladder.len() - 1);
                ladder[idx]
            }
        }
    }
}
