use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tributary_core::broker::{
    BrokerConnection, BrokerError, BrokerResult, BrokerTransport, Credentials, EnsureOutcome,
};
use tributary_core::message::Message;
use tributary_core::topology::{AckPolicy, ConsumerSpec, RetentionPolicy, StreamSpec};

/// Payload ceiling mirroring a typical broker default.
const MAX_PAYLOAD_BYTES: usize = 1 << 20;

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    publish_time: u64,
    attributes: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingDelivery {
    // deliveries so far; the next fetch hands out attempt + 1
    attempts: u32,
    available_at: Instant,
    leased_to: Option<String>,
    lease_expires: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    spec: ConsumerSpec,
    // unresolved deliveries keyed by stream sequence
    pending: HashMap<u64, PendingDelivery>,
    // highest stream sequence admitted into pending
    cursor: u64,
}

#[derive(Debug)]
struct StreamState {
    spec: StreamSpec,
    messages: BTreeMap<u64, StoredMessage>,
    total_bytes: u64,
    next_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn new(spec: StreamSpec) -> Self {
        StreamState {
            spec,
            messages: BTreeMap::new(),
            total_bytes: 0,
            next_sequence: 1,
            consumers: HashMap::new(),
        }
    }

    fn evict(&mut self, sequence: u64) {
        if let Some(evicted) = self.messages.remove(&sequence) {
            self.total_bytes = self.total_bytes.saturating_sub(evicted.payload.len() as u64);
            for consumer in self.consumers.values_mut() {
                consumer.pending.remove(&sequence);
            }
        }
    }

    fn apply_retention(&mut self, now_millis: u64) {
        match self.spec.retention {
            RetentionPolicy::SizeBounded { max_bytes } => {
                while self.total_bytes > max_bytes {
                    match self.messages.keys().next().copied() {
                        Some(oldest) => self.evict(oldest),
                        None => break,
                    }
                }
            }
            RetentionPolicy::AgeBounded { max_age } => {
                let horizon = now_millis.saturating_sub(max_age.as_millis() as u64);
                let expired: Vec<u64> = self
                    .messages
                    .iter()
                    .take_while(|(_, m)| m.publish_time < horizon)
                    .map(|(seq, _)| *seq)
                    .collect();
                for sequence in expired {
                    self.evict(sequence);
                }
            }
            RetentionPolicy::Unbounded => {}
        }
    }
}

/// Whether some concrete subject could match both patterns. Streams with
/// overlapping subject sets would make publish routing ambiguous, so
/// ensure_stream rejects them.
fn patterns_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');
    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => continue,
            (Some(x), Some(y)) if x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Token-wise subject matching: `*` matches exactly one token, `>` matches
/// one or more trailing tokens.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A broker living entirely in process memory: streams, durable queue-group
/// consumers, lease-based redelivery, retention. Topology and cursors
/// survive session close/reopen, which is what dispatch restarts exercise;
/// the `StorageKind` tag is recorded but both kinds live in RAM here.
#[derive(Debug)]
pub struct InMemoryBroker {
    streams: DashMap<String, StreamState>,
    connected: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            streams: DashMap::new(),
            connected: AtomicBool::new(true),
        }
    }

    fn reopen(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn check_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    /// Unresolved deliveries for a durable consumer; test observability.
    pub fn pending_count(&self, stream: &str, durable_name: &str) -> usize {
        self.streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable_name).map(|c| c.pending.len()))
            .unwrap_or(0)
    }

    /// Highest sequence assigned on a stream; test observability.
    pub fn last_sequence(&self, stream: &str) -> u64 {
        self.streams
            .get(stream)
            .map(|s| s.next_sequence - 1)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        attributes: Option<HashMap<String, String>>,
    ) -> BrokerResult<u64> {
        self.check_connected()?;
        if subject.is_empty() {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(BrokerError::PayloadTooLarge(payload.len()));
        }

        let target = self
            .streams
            .iter()
            .find(|entry| {
                entry
                    .spec
                    .subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, subject))
            })
            .map(|entry| entry.key().clone());
        let Some(name) = target else {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        };

        let mut stream = self
            .streams
            .get_mut(&name)
            .ok_or_else(|| BrokerError::NotFound(name.clone()))?;
        let sequence = stream.next_sequence;
        stream.next_sequence += 1;
        stream.total_bytes += payload.len() as u64;
        let publish_time = now_millis();
        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                publish_time,
                attributes: attributes.unwrap_or_default(),
            },
        );
        stream.apply_retention(publish_time);
        Ok(sequence)
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> BrokerResult<EnsureOutcome> {
        self.check_connected()?;

        let same_name_conflict = |existing: &StreamSpec| {
            BrokerError::Conflict(format!(
                "stream {} exists with subjects {:?}, requested {:?}",
                spec.name, existing.subjects, spec.subjects
            ))
        };

        if let Some(existing) = self.streams.get(&spec.name) {
            return if spec.compatible_with(&existing.spec) {
                Ok(EnsureOutcome::AlreadyExists)
            } else {
                Err(same_name_conflict(&existing.spec))
            };
        }

        // a subject captured by two streams would make publish routing
        // ambiguous
        for other in self.streams.iter() {
            for theirs in &other.spec.subjects {
                for ours in &spec.subjects {
                    if patterns_overlap(ours, theirs) {
                        return Err(BrokerError::Conflict(format!(
                            "subject {} of stream {} overlaps {} of existing stream {}",
                            ours,
                            spec.name,
                            theirs,
                            other.key()
                        )));
                    }
                }
            }
        }

        match self.streams.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // lost a provisioning race; converge on the winner
                if spec.compatible_with(&entry.get().spec) {
                    Ok(EnsureOutcome::AlreadyExists)
                } else {
                    Err(same_name_conflict(&entry.get().spec))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(StreamState::new(spec.clone()));
                Ok(EnsureOutcome::Created)
            }
        }
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> BrokerResult<EnsureOutcome> {
        self.check_connected()?;
        let mut stream = self
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", spec.stream)))?;
        match stream.consumers.get(&spec.durable_name) {
            Some(existing) => {
                if spec.compatible_with(&existing.spec) {
                    Ok(EnsureOutcome::AlreadyExists)
                } else {
                    Err(BrokerError::Conflict(format!(
                        "durable consumer {} exists on stream {} with a different configuration",
                        spec.durable_name, spec.stream
                    )))
                }
            }
            None => {
                stream.consumers.insert(
                    spec.durable_name.clone(),
                    ConsumerState {
                        spec: spec.clone(),
                        pending: HashMap::new(),
                        cursor: 0,
                    },
                );
                Ok(EnsureOutcome::Created)
            }
        }
    }

    async fn fetch(
        &self,
        stream: &str,
        durable_name: &str,
        member: &str,
        max_messages: usize,
    ) -> BrokerResult<Vec<Message>> {
        self.check_connected()?;
        let mut state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", stream)))?;
        let state = &mut *state;

        let consumer = state
            .consumers
            .get_mut(durable_name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer {}", durable_name)))?;

        if consumer.spec.ack_policy == AckPolicy::None {
            // fire-and-forget: deliver past the cursor without lease tracking
            let mut batch = Vec::new();
            let sequences: Vec<u64> = state
                .messages
                .range(consumer.cursor + 1..)
                .take(max_messages)
                .map(|(seq, _)| *seq)
                .collect();
            for sequence in sequences {
                consumer.cursor = sequence;
                if let Some(stored) = state.messages.get(&sequence) {
                    batch.push(Message {
                        subject: stored.subject.clone(),
                        payload: stored.payload.clone(),
                        sequence,
                        attempt: 1,
                        publish_time: stored.publish_time,
                        attributes: stored.attributes.clone(),
                    });
                }
            }
            return Ok(batch);
        }

        // admit messages published since the last fetch
        let newly_admitted: Vec<u64> = state
            .messages
            .range(consumer.cursor + 1..)
            .map(|(seq, _)| *seq)
            .collect();
        let now = Instant::now();
        for sequence in newly_admitted {
            consumer.cursor = sequence;
            consumer.pending.insert(
                sequence,
                PendingDelivery {
                    attempts: 0,
                    available_at: now,
                    leased_to: None,
                    lease_expires: now,
                },
            );
        }

        // release expired leases for redelivery
        for delivery in consumer.pending.values_mut() {
            if delivery.leased_to.is_some() && delivery.lease_expires <= now {
                delivery.leased_to = None;
                delivery.available_at = now;
            }
        }

        // lease the oldest available deliveries to this member
        let mut available: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, d)| d.leased_to.is_none() && d.available_at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        available.sort_unstable();
        available.truncate(max_messages);

        let mut batch = Vec::with_capacity(available.len());
        for sequence in available {
            let Some(stored) = state.messages.get(&sequence) else {
                consumer.pending.remove(&sequence);
                continue;
            };
            let Some(delivery) = consumer.pending.get_mut(&sequence) else {
                continue;
            };
            delivery.attempts += 1;
            delivery.leased_to = Some(member.to_string());
            delivery.lease_expires = now + consumer.spec.ack_wait;
            batch.push(Message {
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                sequence,
                attempt: delivery.attempts,
                publish_time: stored.publish_time,
                attributes: stored.attributes.clone(),
            });
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, durable_name: &str, sequence: u64) -> BrokerResult<()> {
        self.check_connected()?;
        let mut state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", stream)))?;
        if let Some(consumer) = state.consumers.get_mut(durable_name) {
            // stray acks after lease expiry are tolerated
            consumer.pending.remove(&sequence);
        }
        Ok(())
    }

    async fn nak(
        &self,
        stream: &str,
        durable_name: &str,
        sequence: u64,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.check_connected()?;
        let mut state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", stream)))?;
        if let Some(consumer) = state.consumers.get_mut(durable_name) {
            if let Some(delivery) = consumer.pending.get_mut(&sequence) {
                delivery.leased_to = None;
                delivery.available_at = Instant::now() + delay;
            }
        }
        Ok(())
    }

    async fn term(&self, stream: &str, durable_name: &str, sequence: u64) -> BrokerResult<()> {
        self.check_connected()?;
        let mut state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", stream)))?;
        if let Some(consumer) = state.consumers.get_mut(durable_name) {
            consumer.pending.remove(&sequence);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Dials sessions against a shared [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryTransport {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        InMemoryTransport { broker }
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn connect(
        &self,
        _address: &str,
        _credentials: Option<&Credentials>,
    ) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.broker.reopen();
        Ok(self.broker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_stream() -> StreamSpec {
        StreamSpec::new(
            "orders",
            vec!["orders.*".to_string()],
        )
    }

    fn workers_consumer() -> ConsumerSpec {
        let mut spec = ConsumerSpec::new("workers", "workers", "orders");
        spec.ack_wait = Duration::from_millis(50);
        spec
    }

    #[tokio::test]
    async fn overlapping_subject_sets_across_streams_are_rejected() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();

        let overlapping = StreamSpec::new("audit", vec!["orders.created".to_string()]);
        let err = broker.ensure_stream(&overlapping).await;
        assert!(matches!(err, Err(BrokerError::Conflict(_))));

        let disjoint = StreamSpec::new("audit", vec!["audit.>".to_string()]);
        assert_eq!(
            broker.ensure_stream(&disjoint).await.unwrap(),
            EnsureOutcome::Created
        );
    }

    #[test]
    fn subject_matching_tokens_and_wildcards() {
        assert!(subject_matches("orders.created", "orders.created"));
        assert!(subject_matches("orders.*", "orders.created"));
        assert!(subject_matches("orders.>", "orders.created.eu"));
        assert!(!subject_matches("orders.*", "orders.created.eu"));
        assert!(!subject_matches("orders.created", "orders.deleted"));
        assert!(!subject_matches("orders.>", "orders"));
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_sequences() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();

        for expected in 1..=5u64 {
            let seq = broker
                .publish("orders.created", b"{}", None)
                .await
                .unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(broker.last_sequence("orders"), 5);
    }

    #[tokio::test]
    async fn publish_to_uncaptured_subject_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();

        let err = broker.publish("invoices.created", b"{}", None).await;
        assert!(matches!(err, Err(BrokerError::InvalidSubject(_))));
    }

    #[tokio::test]
    async fn expired_lease_redelivers_with_higher_attempt() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();
        broker.ensure_consumer(&workers_consumer()).await.unwrap();
        broker
            .publish("orders.created", b"payload", None)
            .await
            .unwrap();

        let first = broker.fetch("orders", "workers", "m1", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 1);

        // leased: nothing available for another member
        let second = broker.fetch("orders", "workers", "m2", 1).await.unwrap();
        assert!(second.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let redelivered = broker.fetch("orders", "workers", "m2", 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempt, 2);
        assert_eq!(redelivered[0].sequence, first[0].sequence);
    }

    #[tokio::test]
    async fn ack_resolves_and_term_never_redelivers() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();
        broker.ensure_consumer(&workers_consumer()).await.unwrap();
        broker.publish("orders.created", b"a", None).await.unwrap();
        broker.publish("orders.updated", b"b", None).await.unwrap();

        let batch = broker.fetch("orders", "workers", "m1", 2).await.unwrap();
        assert_eq!(batch.len(), 2);

        broker.ack("orders", "workers", batch[0].sequence).await.unwrap();
        broker.term("orders", "workers", batch[1].sequence).await.unwrap();
        assert_eq!(broker.pending_count("orders", "workers"), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let after = broker.fetch("orders", "workers", "m1", 2).await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn nak_delay_defers_redelivery() {
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&orders_stream()).await.unwrap();
        broker.ensure_consumer(&workers_consumer()).await.unwrap();
        broker.publish("orders.created", b"x", None).await.unwrap();

        let batch = broker.fetch("orders", "workers", "m1", 1).await.unwrap();
        broker
            .nak("orders", "workers", batch[0].sequence, Duration::from_millis(60))
            .await
            .unwrap();

        let early = broker.fetch("orders", "workers", "m1", 1).await.unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let late = broker.fetch("orders", "workers", "m1", 1).await.unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].attempt, 2);
    }

    #[tokio::test]
    async fn size_bounded_retention_evicts_oldest() {
        let mut spec = orders_stream();
        spec.retention = RetentionPolicy::SizeBounded { max_bytes: 8 };
        let broker = InMemoryBroker::new();
        broker.ensure_stream(&spec).await.unwrap();

        broker.publish("orders.created", b"aaaa", None).await.unwrap();
        broker.publish("orders.created", b"bbbb", None).await.unwrap();
        broker.publish("orders.created", b"cccc", None).await.unwrap();

        broker.ensure_consumer(&workers_consumer()).await.unwrap();
        let batch = broker.fetch("orders", "workers", "m1", 10).await.unwrap();
        let sequences: Vec<u64> = batch.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn topology_survives_session_close() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.ensure_stream(&orders_stream()).await.unwrap();
        broker.ensure_consumer(&workers_consumer()).await.unwrap();
        broker.publish("orders.created", b"x", None).await.unwrap();

        broker.close().await.unwrap();
        assert!(matches!(
            broker.publish("orders.created", b"y", None).await,
            Err(BrokerError::ConnectionClosed)
        ));

        let transport = InMemoryTransport::new(broker.clone());
        let conn = transport.connect("memory://local", None).await.unwrap();
        let batch = conn.fetch("orders", "workers", "m1", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
