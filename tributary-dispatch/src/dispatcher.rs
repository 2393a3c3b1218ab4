use crate::connection::ConnectionManager;
use crate::errors::{DispatchError, Result};
use crate::provision::TopologyProvisioner;

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tributary_core::broker::BrokerConnection;
use tributary_core::message::{Message, Outcome};
use tributary_core::topology::{ConsumerSpec, StreamSpec};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the completion channel between handler tasks and the loop.
const COMPLETION_CHANNEL_BUFFER: usize = 64;

/// Processes one delivered message and reports the verdict.
///
/// Implementations may suspend on their own I/O; the dispatcher neither
/// knows nor cares, it only waits for the [`Outcome`]. A panic inside a
/// handler is caught and treated as a redelivery request, never allowed to
/// take the dispatch loop down.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message) -> Outcome;
}

/// Plain async functions work as handlers.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Outcome {
        self(message).await
    }
}

/// Dispatcher lifecycle, observable through [`Dispatcher::state_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Configuration options for dispatchers
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    // member name registered with the queue group
    pub member_name: String,
    // destination for terminally failed messages; None discards with a log
    pub dead_letter_subject: Option<String>,
    // how long stop() waits for in-flight handlers before abandoning them
    pub drain_timeout: Duration,
    // pacing between empty pulls
    pub poll_interval: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        DispatcherOptions {
            member_name: "member-0".to_string(),
            dead_letter_subject: None,
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
enum LoopCommand {
    Drain {
        deadline: Instant,
        done: oneshot::Sender<usize>,
    },
}

/// Completion report sent by a handler task back to the owning loop. Carries
/// the message so termination can route it to the dead-letter subject.
#[derive(Debug)]
struct Completion {
    message: Message,
    outcome: Outcome,
}

/// Entry in the in-flight set: when the lease was taken and the task that
/// holds it. Owned exclusively by the dispatch loop.
#[derive(Debug)]
struct InFlightEntry {
    acquired_at: Instant,
    task: JoinHandle<()>,
}

/// Pulls messages from a durable queue-group consumer and runs a handler
/// invocation per message, up to `max_in_flight` concurrently.
///
/// The pull loop suspends while the in-flight set is full; it resumes as
/// handler outcomes free slots. `stop()` drains: no new pulls, in-flight
/// handlers run to completion or the drain timeout, and anything still
/// unacknowledged at the deadline is left for the broker to redeliver.
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn Handler>,
    stream_spec: StreamSpec,
    consumer_spec: ConsumerSpec,
    options: DispatcherOptions,
    state_tx: watch::Sender<DispatcherState>,
    state_rx: watch::Receiver<DispatcherState>,
    control_tx: Option<mpsc::Sender<LoopCommand>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    fn new(
        manager: Arc<ConnectionManager>,
        handler: Arc<dyn Handler>,
        stream_spec: StreamSpec,
        consumer_spec: ConsumerSpec,
        options: DispatcherOptions,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(DispatcherState::Stopped);
        Dispatcher {
            manager,
            handler,
            stream_spec,
            consumer_spec,
            options,
            state_tx,
            state_rx,
            control_tx: None,
            loop_handle: None,
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<DispatcherState> {
        self.state_rx.clone()
    }

    /// Provision topology and begin pulling. A topology conflict is logged
    /// and tolerated: the existing stream or consumer keeps its
    /// configuration and dispatch proceeds against it.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != DispatcherState::Stopped {
            return Err(DispatchError::InvalidState(format!(
                "dispatcher cannot start from {:?}",
                self.state()
            )));
        }
        self.state_tx.send_replace(DispatcherState::Starting);

        let provisioner = TopologyProvisioner::new(self.manager.clone());
        match provisioner.ensure_stream(&self.stream_spec).await {
            Ok(_) => {}
            Err(DispatchError::TopologyConflict(_)) => {}
            Err(e) => {
                self.state_tx.send_replace(DispatcherState::Stopped);
                return Err(e);
            }
        }
        match provisioner.ensure_consumer(&self.consumer_spec).await {
            Ok(_) => {}
            Err(DispatchError::TopologyConflict(_)) => {}
            Err(e) => {
                self.state_tx.send_replace(DispatcherState::Stopped);
                return Err(e);
            }
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_BUFFER);

        let dispatch_loop = DispatchLoop {
            manager: self.manager.clone(),
            handler: self.handler.clone(),
            consumer: self.consumer_spec.clone(),
            options: self.options.clone(),
            state_tx: self.state_tx.clone(),
            in_flight: HashMap::new(),
            completion_tx,
        };
        self.loop_handle = Some(tokio::spawn(dispatch_loop.run(control_rx, completion_rx)));
        self.control_tx = Some(control_tx);
        self.state_tx.send_replace(DispatcherState::Running);
        info!(
            stream = %self.consumer_spec.stream,
            durable = %self.consumer_spec.durable_name,
            member = %self.options.member_name,
            "dispatcher running"
        );
        Ok(())
    }

    /// Drain and stop. Returns `DrainTimeout` carrying the abandoned count
    /// when in-flight handlers outlived the drain window; those messages
    /// stay unacknowledged and the broker redelivers them later.
    pub async fn stop(&mut self) -> Result<()> {
        let control_tx = self.control_tx.take().ok_or_else(|| {
            DispatchError::InvalidState("dispatcher is not running".to_string())
        })?;

        let deadline = Instant::now() + self.options.drain_timeout;
        let (done_tx, done_rx) = oneshot::channel();
        let abandoned = if control_tx
            .send(LoopCommand::Drain {
                deadline,
                done: done_tx,
            })
            .await
            .is_ok()
        {
            done_rx.await.unwrap_or(0)
        } else {
            0
        };

        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }

        if abandoned > 0 {
            return Err(DispatchError::DrainTimeout(abandoned));
        }
        Ok(())
    }
}

struct DispatchLoop {
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn Handler>,
    consumer: ConsumerSpec,
    options: DispatcherOptions,
    state_tx: watch::Sender<DispatcherState>,
    in_flight: HashMap<u64, InFlightEntry>,
    completion_tx: mpsc::Sender<Completion>,
}

impl DispatchLoop {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<LoopCommand>,
        mut completion_rx: mpsc::Receiver<Completion>,
    ) {
        let mut draining = false;
        let mut drain_deadline: Option<Instant> = None;
        let mut drain_done: Option<oneshot::Sender<usize>> = None;

        loop {
            let slots = self.consumer.max_in_flight.saturating_sub(self.in_flight.len());
            let can_pull = !draining && slots > 0;
            let pull = pull_batch(
                self.manager.clone(),
                self.consumer.stream.clone(),
                self.consumer.durable_name.clone(),
                self.options.member_name.clone(),
                slots,
                self.options.poll_interval,
            );
            let deadline = drain_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                cmd = control_rx.recv() => {
                    match cmd {
                        Some(LoopCommand::Drain { deadline, done }) => {
                            draining = true;
                            self.state_tx.send_replace(DispatcherState::Draining);
                            debug!(in_flight = self.in_flight.len(), "draining, no further pulls");
                            if self.in_flight.is_empty() {
                                let _ = done.send(0);
                                break;
                            }
                            drain_deadline = Some(deadline);
                            drain_done = Some(done);
                        }
                        // the owning handle is gone; abandon in-flight work
                        // and let ack_wait expiry route it elsewhere
                        None => break,
                    }
                }
                Some(completion) = completion_rx.recv() => {
                    self.settle(completion).await;
                    if draining && self.in_flight.is_empty() {
                        if let Some(done) = drain_done.take() {
                            let _ = done.send(0);
                        }
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if draining && drain_deadline.is_some() => {
                    let abandoned = self.in_flight.len();
                    warn!(abandoned, "drain timeout elapsed, leaving messages unacknowledged");
                    // handlers past the deadline are cut off; their leases
                    // expire on the broker side and redeliver elsewhere
                    for entry in self.in_flight.values() {
                        entry.task.abort();
                    }
                    if let Some(done) = drain_done.take() {
                        let _ = done.send(abandoned);
                    }
                    break;
                }
                fetched = pull, if can_pull => {
                    match fetched {
                        Ok(batch) => {
                            for message in batch {
                                self.begin(message);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "pull failed, backing off");
                        }
                    }
                }
            }
        }

        self.state_tx.send_replace(DispatcherState::Stopped);
        info!(member = %self.options.member_name, "dispatch loop stopped");
    }

    /// Hand one message to a handler task and record the in-flight lease.
    fn begin(&mut self, message: Message) {
        let sequence = message.sequence;
        trace!(sequence, attempt = message.attempt, "handler invocation starting");

        let handler = self.handler.clone();
        let completion_tx = self.completion_tx.clone();
        let task = tokio::spawn(async move {
            let retained = message.clone();
            let outcome = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(sequence, "handler panicked, requesting redelivery");
                    Outcome::nak()
                }
            };
            // the loop may already be gone during shutdown; the lease then
            // simply expires on the broker side
            let _ = completion_tx
                .send(Completion {
                    message: retained,
                    outcome,
                })
                .await;
        });

        self.in_flight.insert(
            sequence,
            InFlightEntry {
                acquired_at: Instant::now(),
                task,
            },
        );
    }

    /// Report one outcome back to the broker and release the lease.
    async fn settle(&mut self, completion: Completion) {
        let Completion { message, outcome } = completion;
        if let Some(entry) = self.in_flight.remove(&message.sequence) {
            trace!(
                sequence = message.sequence,
                elapsed_ms = entry.acquired_at.elapsed().as_millis() as u64,
                "handler invocation finished"
            );
        }

        let conn = match self.manager.current().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    sequence = message.sequence,
                    error = %e,
                    "no broker session to report outcome, message will redeliver"
                );
                return;
            }
        };

        let stream = &self.consumer.stream;
        let durable = &self.consumer.durable_name;
        match outcome {
            Outcome::Ack => {
                if let Err(e) = conn.ack(stream, durable, message.sequence).await {
                    warn!(sequence = message.sequence, error = %e, "ack failed");
                }
            }
            Outcome::Nak { retry_after } => {
                if message.attempt as usize >= self.consumer.max_deliver {
                    warn!(
                        sequence = message.sequence,
                        attempts = message.attempt,
                        "delivery attempts exhausted, terminating"
                    );
                    self.terminate(&conn, &message, "delivery attempts exhausted")
                        .await;
                } else {
                    let delay =
                        retry_after.unwrap_or_else(|| self.consumer.redelivery_delay(message.attempt));
                    if let Err(e) = conn.nak(stream, durable, message.sequence, delay).await {
                        warn!(sequence = message.sequence, error = %e, "nak failed");
                    }
                }
            }
            Outcome::Term { reason } => {
                self.terminate(&conn, &message, &reason).await;
            }
        }
    }

    /// Permanent failure: route to the dead-letter subject when configured,
    /// then terminally reject so the broker never redelivers.
    async fn terminate(&self, conn: &Arc<dyn BrokerConnection>, message: &Message, reason: &str) {
        if let Some(dead_letter) = &self.options.dead_letter_subject {
            let mut attributes = message.attributes.clone();
            attributes.insert("origin_subject".to_string(), message.subject.clone());
            attributes.insert("termination_reason".to_string(), reason.to_string());
            attributes.insert("delivery_attempts".to_string(), message.attempt.to_string());
            match conn
                .publish(dead_letter, &message.payload, Some(attributes))
                .await
            {
                Ok(sequence) => {
                    debug!(
                        sequence = message.sequence,
                        dead_letter_sequence = sequence,
                        subject = %dead_letter,
                        "message routed to dead-letter subject"
                    );
                }
                Err(e) => {
                    error!(
                        sequence = message.sequence,
                        subject = %dead_letter,
                        error = %e,
                        "dead-letter publish failed"
                    );
                }
            }
        } else {
            warn!(
                sequence = message.sequence,
                subject = %message.subject,
                %reason,
                "message terminated without a dead-letter subject"
            );
        }

        if let Err(e) = conn
            .term(&self.consumer.stream, &self.consumer.durable_name, message.sequence)
            .await
        {
            warn!(sequence = message.sequence, error = %e, "term failed");
        }
    }
}

/// One pull against the queue-group consumer, paced so an empty or failing
/// pull does not spin the loop.
async fn pull_batch(
    manager: Arc<ConnectionManager>,
    stream: String,
    durable: String,
    member: String,
    max_messages: usize,
    idle: Duration,
) -> Result<Vec<Message>> {
    let conn = manager.current().await?;
    match conn.fetch(&stream, &durable, &member, max_messages).await {
        Ok(batch) if batch.is_empty() => {
            tokio::time::sleep(idle).await;
            Ok(batch)
        }
        Ok(batch) => Ok(batch),
        Err(e) => {
            tokio::time::sleep(idle).await;
            Err(e.into())
        }
    }
}

/// Builder for [`Dispatcher`] instances.
#[derive(Default)]
pub struct DispatcherBuilder {
    manager: Option<Arc<ConnectionManager>>,
    handler: Option<Arc<dyn Handler>>,
    stream_spec: Option<StreamSpec>,
    consumer_spec: Option<ConsumerSpec>,
    options: DispatcherOptions,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        DispatcherBuilder {
            manager: None,
            handler: None,
            stream_spec: None,
            consumer_spec: None,
            options: DispatcherOptions::default(),
        }
    }

    pub fn with_connection(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_stream(mut self, spec: StreamSpec) -> Self {
        self.stream_spec = Some(spec);
        self
    }

    pub fn with_consumer(mut self, spec: ConsumerSpec) -> Self {
        self.consumer_spec = Some(spec);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let manager = self.manager.ok_or_else(|| {
            DispatchError::InvalidState("a connection manager is required to build a Dispatcher".into())
        })?;
        let handler = self.handler.ok_or_else(|| {
            DispatchError::InvalidState("a handler is required to build a Dispatcher".into())
        })?;
        let stream_spec = self.stream_spec.ok_or_else(|| {
            DispatchError::InvalidState("a stream spec is required to build a Dispatcher".into())
        })?;
        let consumer_spec = self.consumer_spec.ok_or_else(|| {
            DispatchError::InvalidState("a consumer spec is required to build a Dispatcher".into())
        })?;

        stream_spec.validate()?;
        consumer_spec.validate()?;
        if consumer_spec.stream != stream_spec.name {
            return Err(DispatchError::InvalidState(format!(
                "consumer {} is bound to stream {}, not {}",
                consumer_spec.durable_name, consumer_spec.stream, stream_spec.name
            )));
        }

        Ok(Dispatcher::new(
            manager,
            handler,
            stream_spec,
            consumer_spec,
            self.options,
        ))
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
