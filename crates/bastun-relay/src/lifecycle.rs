//! Lifecycle controller: turns stop signals into exactly one cleanup.
//!
//! The controller waits for whichever comes first:
//! - the caller's cancellation token (operator interrupt),
//! - the configured timeout, or
//! - the accept loop exiting on its own (checked every poll interval).
//!
//! It then calls [`TunnelServer::cleanup`] once. [`LifecycleController::stop`]
//! may also be called directly, from any task; concurrent stops still clean
//! up only once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::server::TunnelServer;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why the tunnel was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    TimedOut,
    AcceptLoopExited,
    /// The local client the tunnel was opened for has exited.
    ClientExited,
}

pub struct LifecycleController {
    server: Arc<TunnelServer>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    poll_interval: Duration,
    stopped: Mutex<Option<StopReason>>,
}

impl LifecycleController {
    pub fn new(server: Arc<TunnelServer>, cancel: CancellationToken) -> Self {
        Self {
            server,
            cancel,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stopped: Mutex::new(None),
        }
    }

    /// Clean up unconditionally after `timeout`. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait for a stop signal, clean up, and report what stopped the tunnel.
    pub async fn run(&self) -> StopReason {
        debug!(timeout = ?self.timeout, "waiting for stop signal");
        let reason = tokio::select! {
            _ = self.cancel.cancelled() => StopReason::Interrupted,
            reason = self.wait() => reason,
        };
        self.stop(reason).await
    }

    async fn wait(&self) -> StopReason {
        match self.timeout {
            Some(timeout) => {
                time::sleep(timeout).await;
                StopReason::TimedOut
            }
            None => {
                let mut ticker = time::interval(self.poll_interval.max(Duration::from_millis(1)));
                loop {
                    ticker.tick().await;
                    if !self.server.is_accepting().await {
                        return StopReason::AcceptLoopExited;
                    }
                }
            }
        }
    }

    /// Clean up the server once. Returns the reason recorded by whichever
    /// stop happened first.
    pub async fn stop(&self, reason: StopReason) -> StopReason {
        let mut stopped = self.stopped.lock().await;
        if let Some(first) = *stopped {
            debug!(?reason, ?first, "tunnel already stopped");
            return first;
        }
        info!(?reason, "closing tunnel");
        self.server.cleanup().await;
        *stopped = Some(reason);
        reason
    }

    /// The reason the tunnel stopped, if it has.
    pub async fn stop_reason(&self) -> Option<StopReason> {
        *self.stopped.lock().await
    }
}
