use crate::errors::{DispatchError, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tributary_core::broker::{BrokerConnection, BrokerTransport, Credentials};
use tracing::{debug, info, warn};

/// Connection lifecycle states broadcast to observers so higher layers can
/// pause or resume their own activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closed,
}

/// Backoff applied between reconnect rounds after all addresses failed.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    // delay before the first retry round
    pub initial_delay: Duration,
    // growth factor applied per round
    pub multiplier: f64,
    // upper bound on the per-round delay
    pub max_delay: Duration,
    // None retries forever at the capped interval
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry round `attempt` (zero-based), exponential and
    /// capped.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let delay = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    // broker addresses, tried in order
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
    // connection name reported in logs (and to brokers that accept one)
    pub client_name: String,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionOptions {
    pub fn new(addresses: Vec<String>) -> Self {
        ConnectionOptions {
            addresses,
            credentials: None,
            client_name: "tributary".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[derive(Debug, Clone)]
enum ConnectionStatus {
    Connected(Arc<dyn BrokerConnection>),
    Disconnected,
}

/// Owns the one live broker session for a service instance. Publishers and
/// dispatchers hold the manager, not the raw connection; a lost session is
/// re-dialed here with backoff and every transition is broadcast.
#[derive(Debug)]
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    options: ConnectionOptions,
    status: Mutex<ConnectionStatus>,
    closed: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, options: ConnectionOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            transport,
            options,
            status: Mutex::new(ConnectionStatus::Disconnected),
            closed: AtomicBool::new(false),
            state_tx,
            state_rx,
        }
    }

    /// Establish the initial session. Equivalent to the first `current()`
    /// call; exists so startup code reads naturally.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.current().await
    }

    /// The live session, re-dialing under the manager's reconnect policy if
    /// the previous one was lost. Concurrent callers share a single dial.
    pub async fn current(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection(
                "connection manager is closed".to_string(),
            ));
        }

        let mut status = self.status.lock().await;
        if let ConnectionStatus::Connected(conn) = &*status {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            warn!(client = %self.options.client_name, "broker session lost, re-dialing");
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }

        let conn = self.dial().await?;
        *status = ConnectionStatus::Connected(conn.clone());
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(conn)
    }

    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut round = 0;
        loop {
            for address in &self.options.addresses {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(DispatchError::Connection(
                        "connection manager closed while dialing".to_string(),
                    ));
                }
                match self
                    .transport
                    .connect(address, self.options.credentials.as_ref())
                    .await
                {
                    Ok(conn) => {
                        info!(
                            client = %self.options.client_name,
                            address = %address,
                            "connected to broker"
                        );
                        return Ok(conn);
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "broker address unreachable");
                    }
                }
            }

            if let Some(max) = self.options.reconnect.max_attempts {
                if round + 1 >= max {
                    return Err(DispatchError::Connection(format!(
                        "unable to reach any of {} broker addresses after {} attempts",
                        self.options.addresses.len(),
                        max
                    )));
                }
            }
            let delay = self.options.reconnect.delay_for(round);
            debug!(round, delay_ms = delay.as_millis() as u64, "retrying broker connection");
            tokio::time::sleep(delay).await;
            round += 1;
        }
    }

    /// Observer channel for connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Mark the current session unusable; the next `current()` re-dials.
    pub async fn invalidate(&self) {
        let mut status = self.status.lock().await;
        if matches!(&*status, ConnectionStatus::Connected(_)) {
            warn!(client = %self.options.client_name, "broker session invalidated");
            *status = ConnectionStatus::Disconnected;
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Terminal close. Further `current()` calls fail.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut status = self.status.lock().await;
        if let ConnectionStatus::Connected(conn) = &*status {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "error closing broker session");
            }
        }
        *status = ConnectionStatus::Disconnected;
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(client = %self.options.client_name, "broker connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;
