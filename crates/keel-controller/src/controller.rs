//! The control surface: application lifecycle, status, sync, rollback and
//! history, over one worker loop per application.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use keel_core::models::{
    Application, ApplicationState, ApplicationStatus, HistoryEntry, Initiator, SyncPlan,
    SyncResult,
};
use keel_storage::FileStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::ClusterBackend;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::fetcher::Fetcher;
use crate::history::HistoryStore;
use crate::reconcile::{ControllerContext, DEFAULT_OPERATOR, Reconciler, SyncRequest};
use crate::source::SourceRepo;
use crate::store::ApplicationStore;
use crate::worker::{WakeHandle, Worker};

pub struct Controller {
    ctx: Arc<ControllerContext>,
    workers: Mutex<HashMap<String, Worker>>,
    running: AtomicBool,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn SourceRepo>,
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let retry = config.retry_policy();
        let files = FileStore::new(&config.state_dir);
        let ctx = ControllerContext {
            store: ApplicationStore::new(files.clone()),
            history: HistoryStore::new(files, config.history_limit),
            fetcher: Fetcher::new(source, retry.clone()),
            backend,
            retry,
            config,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.ctx.config
    }

    /// Load persisted applications and start a loop for each.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let mut workers = self.workers.lock().await;
        if self.running.load(Ordering::SeqCst) {
            tracing::debug!("controller already running");
            return Ok(());
        }

        let apps = self.ctx.store.load().await?;
        for app in &apps {
            workers.insert(app.name.clone(), self.spawn(&app.name));
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            applications = apps.len(),
            state_dir = %self.ctx.config.state_dir.display(),
            "controller started"
        );
        Ok(())
    }

    /// Stop every loop, cancelling in-flight syncs between entries.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        self.running.store(false, Ordering::SeqCst);
        let stopping: Vec<Worker> = workers.drain().map(|(_, w)| w).collect();
        let count = stopping.len();
        join_all(stopping.into_iter().map(Worker::stop)).await;
        tracing::info!(workers = count, "controller stopped");
    }

    pub async fn create_application(&self, app: Application) -> Result<(), ControllerError> {
        app.validate()?;
        let mut workers = self.workers.lock().await;
        self.ensure_running()?;

        self.ctx.store.insert(app.clone()).await?;
        workers.insert(app.name.clone(), self.spawn(&app.name));
        tracing::info!(
            app = %app.name,
            repo = %app.source.repo_url,
            target = %app.source.target_revision,
            automated = app.sync_policy.automated,
            "application created"
        );
        Ok(())
    }

    /// Replace an application's spec and reconcile it right away.
    pub async fn update_application(&self, app: Application) -> Result<(), ControllerError> {
        app.validate()?;
        let wake = self.wake_handle(&app.name).await?;
        let previous = self.ctx.store.get(&app.name).await?;
        self.ctx.store.update(app.clone()).await?;

        if previous.source != app.source {
            self.ctx
                .store
                .update_state(&app.name, |s| s.source_failure = None)
                .await?;
        }
        tracing::info!(app = %app.name, "application updated");
        wake.wake();
        Ok(())
    }

    /// Stop an application's loop and forget it. With `cascade`, every live
    /// resource it tracks is deleted first; if that fails the application
    /// keeps running.
    ///
    /// Any running sync is cancelled and allowed to record its result before
    /// the spec, status and history are removed. Other applications are not
    /// held up while this waits on the backend.
    pub async fn delete_application(&self, name: &str, cascade: bool) -> Result<(), ControllerError> {
        let worker = {
            let mut workers = self.workers.lock().await;
            self.ensure_running()?;
            workers
                .remove(name)
                .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))?
        };
        let reconciler = worker.reconciler().clone();
        worker.stop().await;

        let guard = reconciler.exclusive().await;
        if cascade {
            let torn_down = match self.ctx.store.get(name).await {
                Ok(app) => reconciler.teardown(&app, &guard).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = torn_down {
                tracing::error!(app = %name, error = %e, "cascade delete failed, restarting loop");
                reconciler.retire(&guard);
                drop(guard);
                let mut workers = self.workers.lock().await;
                if self.running.load(Ordering::SeqCst) {
                    workers.insert(name.to_string(), self.spawn(name));
                }
                return Err(e);
            }
        }

        reconciler.retire(&guard);
        self.ctx.history.remove(name).await?;
        let app = self.ctx.store.remove(name).await?;
        self.ctx.fetcher.invalidate(&app.source).await;
        drop(guard);
        tracing::info!(app = %name, cascade, "application deleted");
        Ok(())
    }

    pub async fn get_status(&self, name: &str) -> Result<ApplicationStatus, ControllerError> {
        self.ensure_running()?;
        self.ctx.store.status(name).await
    }

    /// Last plan, last sync result and cause, alongside the derived status.
    pub async fn get_state(&self, name: &str) -> Result<ApplicationState, ControllerError> {
        self.ensure_running()?;
        self.ctx.store.state(name).await
    }

    pub async fn list_applications(&self) -> Result<Vec<Application>, ControllerError> {
        self.ensure_running()?;
        Ok(self.ctx.store.list().await)
    }

    /// Sync now, taking priority over the automatic loop.
    pub async fn request_sync(
        &self,
        name: &str,
        request: SyncRequest,
    ) -> Result<SyncResult, ControllerError> {
        let reconciler = self.reconciler(name).await?;
        let actor = request
            .requested_by
            .clone()
            .unwrap_or_else(|| DEFAULT_OPERATOR.to_string());
        reconciler.sync(request, Initiator::Operator(actor)).await
    }

    /// Re-sync a revision recorded in the application's history.
    pub async fn rollback(&self, name: &str, revision: &str) -> Result<SyncResult, ControllerError> {
        self.reconciler(name).await?.rollback(revision).await
    }

    /// What a sync of `revision` (default: the target) would do, without doing it.
    pub async fn preview(&self, name: &str, revision: Option<&str>) -> Result<SyncPlan, ControllerError> {
        self.reconciler(name).await?.preview(revision).await
    }

    /// Retained history, oldest first.
    pub async fn list_history(&self, name: &str) -> Result<Vec<HistoryEntry>, ControllerError> {
        self.ensure_running()?;
        self.ctx.store.get(name).await?;
        self.ctx.history.list(name).await
    }

    /// Wake the application's loop. A hard refresh also drops cached
    /// revisions and retries a source that failed permanently.
    pub async fn refresh(&self, name: &str, hard: bool) -> Result<(), ControllerError> {
        let workers = self.workers.lock().await;
        self.ensure_running()?;
        let worker = workers
            .get(name)
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))?;

        if hard {
            let app = self.ctx.store.get(name).await?;
            self.ctx.fetcher.invalidate(&app.source).await;
            worker.reconciler().request_source_retry();
        }
        tracing::debug!(app = %name, hard, "refresh requested");
        worker.wake();
        Ok(())
    }

    /// Cancel the application's in-flight sync. Returns whether one was running.
    pub async fn cancel_sync(&self, name: &str) -> Result<bool, ControllerError> {
        Ok(self.reconciler(name).await?.cancel())
    }

    fn ensure_running(&self) -> Result<(), ControllerError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControllerError::NotRunning)
        }
    }

    fn spawn(&self, name: &str) -> Worker {
        let reconciler = Reconciler::new(name, self.ctx.clone(), CancellationToken::new());
        Worker::spawn(Arc::new(reconciler))
    }

    async fn reconciler(&self, name: &str) -> Result<Arc<Reconciler>, ControllerError> {
        let workers = self.workers.lock().await;
        self.ensure_running()?;
        workers
            .get(name)
            .map(|w| w.reconciler().clone())
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))
    }

    async fn wake_handle(&self, name: &str) -> Result<WakeHandle, ControllerError> {
        let workers = self.workers.lock().await;
        self.ensure_running()?;
        workers
            .get(name)
            .map(Worker::wake_handle)
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))
    }
}
