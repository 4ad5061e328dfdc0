//! One background task per application: reconcile, then idle until the poll
//! interval elapses, a refresh arrives, or the worker is stopped.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorClass;
use crate::reconcile::Reconciler;

/// Wakes one application's loop without holding on to the worker.
#[derive(Clone)]
pub struct WakeHandle(Arc<Notify>);

impl WakeHandle {
    /// Wakes that arrive while a cycle is running coalesce into one
    /// follow-up cycle.
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

/// Handle to a running application loop.
pub struct Worker {
    reconciler: Arc<Reconciler>,
    wake: Arc<Notify>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the loop. The first cycle runs immediately; the loop exits when
    /// the reconciler's stop token is cancelled.
    pub fn spawn(reconciler: Arc<Reconciler>) -> Self {
        let stop = reconciler.stop_token().clone();
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run(reconciler.clone(), wake.clone(), stop.clone()));
        tracing::info!(app = %reconciler.name(), "worker started");
        Self {
            reconciler,
            wake,
            stop,
            handle,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Wake the loop early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle(self.wake.clone())
    }

    /// Stop the loop and wait for it to exit. An in-flight sync is cancelled
    /// between entries.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(app = %self.reconciler.name(), error = %e, "worker task failed");
        }
        tracing::info!(app = %self.reconciler.name(), "worker stopped");
    }
}

async fn run(reconciler: Arc<Reconciler>, wake: Arc<Notify>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        // Not raced against `stop`: a stop cancels the sync between entries
        // and the cycle records its result before the loop exits.
        match reconciler.reconcile().await {
            Ok(status) => {
                tracing::debug!(app = %reconciler.name(), status = %status, "cycle complete");
            }
            Err(e) => match e.class() {
                ErrorClass::Transient => {
                    tracing::warn!(app = %reconciler.name(), error = %e, "cycle failed, will retry next poll");
                }
                ErrorClass::PermanentSource => {
                    tracing::error!(app = %reconciler.name(), error = %e, "source unusable until updated");
                }
                _ => {
                    tracing::error!(app = %reconciler.name(), error = %e, "cycle failed");
                }
            },
        }

        let interval = reconciler.poll_interval().await;
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = wake.notified() => {
                tracing::debug!(app = %reconciler.name(), "refresh requested");
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
