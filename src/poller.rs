//! Background status poller.
//!
//! Samples the session's status register on a fixed period and publishes
//! each sample through the session's status channel. The poller is a
//! convenience layer over [`DeviceSession::status`]; callers that poll on
//! their own schedule do not need it.

use crate::session::{DeviceSession, Lifecycle};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a running background poller.
pub struct StatusPoller {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl StatusPoller {
    /// Spawn a poller that samples `session` every `period`.
    ///
    /// Each successful sample is published to the session's status
    /// subscribers. Failed samples are logged and skipped. The task ends
    /// on [`stop`](Self::stop) or when it observes the session has been
    /// disconnected.
    pub fn spawn(session: Arc<DeviceSession>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // A stalled driver should not cause a burst of catch-up polls.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("status poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if session.lifecycle().await == Lifecycle::Uninitialized {
                            debug!("session disconnected, status poller exiting");
                            break;
                        }
                        if let Err(e) = session.status().await {
                            warn!("status poll failed: {e}");
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the poller and wait for its task to finish.
    pub async fn stop(self) {
        // Send fails only if the task already exited on its own.
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("status poller task ended abnormally: {e}");
        }
    }
}
