use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::errors::DispatchError;

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{info, warn};

/// Converts termination signals into an ordered drain-then-close sequence:
/// the dispatcher stops pulling and drains first, then the connection
/// manager closes. Each step is bounded; a blown drain window is logged and
/// tolerated so process exit is never held hostage by a slow handler.
pub struct ShutdownCoordinator {
    // bound on each shutdown step, over and above the dispatcher's own
    // drain timeout
    step_timeout: Duration,
    trigger: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        ShutdownCoordinator {
            step_timeout,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Programmatic termination, equivalent to receiving a signal. A
    /// trigger fired before anyone is waiting is remembered.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Wait for SIGINT/SIGTERM (or a programmatic trigger), then run the
    /// ordered shutdown. Returns the process exit code: 0 on a clean drain,
    /// non-zero when the drain window was exceeded.
    pub async fn run(&self, dispatcher: &mut Dispatcher, manager: &ConnectionManager) -> i32 {
        self.wait_for_signal().await;
        self.shutdown(dispatcher, manager).await
    }

    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT, initiating graceful shutdown");
            }
            _ = terminate => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
            _ = self.trigger.notified() => {
                info!("shutdown triggered, initiating graceful shutdown");
            }
        }
    }

    /// The ordered sequence itself, without waiting for a signal.
    pub async fn shutdown(&self, dispatcher: &mut Dispatcher, manager: &ConnectionManager) -> i32 {
        let mut exit_code = 0;

        match timeout(self.step_timeout, dispatcher.stop()).await {
            Ok(Ok(())) => info!("dispatcher drained cleanly"),
            Ok(Err(DispatchError::DrainTimeout(in_flight))) => {
                warn!(
                    in_flight,
                    "drain timeout exceeded, unacknowledged messages will redeliver"
                );
                exit_code = 1;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "dispatcher stop failed");
                exit_code = 1;
            }
            Err(_) => {
                warn!("dispatcher stop exceeded the shutdown step timeout");
                exit_code = 1;
            }
        }

        match timeout(self.step_timeout, manager.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "error closing broker connection"),
            Err(_) => warn!("connection close exceeded the shutdown step timeout"),
        }

        exit_code
    }
}

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_test;
