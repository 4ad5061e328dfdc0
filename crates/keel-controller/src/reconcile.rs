//! The per-application state machine: poll, diff, and sync when policy or an
//! operator asks for it.
//!
//! At most one sync per application runs at a time, guarded by `sync_lock`.
//! Manual requests take priority: they cancel an in-flight automatic sync,
//! wait for the lock, then re-diff before executing. An automatic cycle that
//! finds a manual request queued steps aside.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::models::{
    Action, Application, ApplicationStatus, DesiredResource, HistoryEntry, Initiator, ResourceKey,
    ResourceKind, SyncOption, SyncPlan, SyncResult,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::ClusterBackend;
use crate::config::ControllerConfig;
use crate::diff::{DiffOptions, diff, diff_with};
use crate::error::{ControllerError, ErrorClass, format_err_chain};
use crate::fetcher::Fetcher;
use crate::history::HistoryStore;
use crate::observe::observe;
use crate::retry::RetryPolicy;
use crate::store::ApplicationStore;
use crate::sync::{self, SyncContext};

/// Actor recorded for requests that do not name one.
pub const DEFAULT_OPERATOR: &str = "operator";

/// Collaborators shared by every application's reconciler.
pub struct ControllerContext {
    pub config: ControllerConfig,
    pub store: ApplicationStore,
    pub history: HistoryStore,
    pub fetcher: Fetcher,
    pub backend: Arc<dyn ClusterBackend>,
    pub retry: RetryPolicy,
}

/// Options for an explicit sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Re-apply resources that are already in sync, unless the application
    /// sets `ApplyOutOfSyncOnly`.
    pub force: bool,
    /// Overrides the policy's prune flag for this run only.
    pub prune: Option<bool>,
    /// Sync this revision instead of the application's target.
    pub revision: Option<String>,
    pub requested_by: Option<String>,
}

struct InFlight {
    token: CancellationToken,
    automated: bool,
}

/// Proof that the caller holds an application's sync lock.
pub struct SyncGuard<'a> {
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

/// Decrements the pending-manual counter however the request ends.
struct PendingManual<'a>(&'a AtomicUsize);

impl<'a> PendingManual<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingManual<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Reconciler {
    name: String,
    ctx: Arc<ControllerContext>,
    sync_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<InFlight>>,
    manual_pending: AtomicUsize,
    /// Set by a hard refresh: retry a source that failed permanently.
    retry_source: AtomicBool,
    /// Set once the application is being deleted; no further work is accepted.
    retired: AtomicBool,
    /// Cancelled when the application's loop stops; every sync run is a child.
    stop: CancellationToken,
}

impl Reconciler {
    pub fn new(name: impl Into<String>, ctx: Arc<ControllerContext>, stop: CancellationToken) -> Self {
        Self {
            name: name.into(),
            ctx,
            sync_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            manual_pending: AtomicUsize::new(0),
            retry_source: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Poll interval for this application, re-read on every cycle.
    pub async fn poll_interval(&self) -> std::time::Duration {
        let secs = match self.ctx.store.get(&self.name).await {
            Ok(app) => app.poll_interval_secs,
            Err(_) => None,
        };
        std::time::Duration::from_secs(secs.unwrap_or(self.ctx.config.poll_interval_secs))
    }

    /// Cancel any running sync, automatic or manual, and wait for it to
    /// record its result. Holding the returned guard keeps every other sync
    /// and poll cycle of this application out.
    pub async fn exclusive(&self) -> SyncGuard<'_> {
        // Every sync token is a child of `stop`.
        self.stop.cancel();
        SyncGuard {
            _lock: self.sync_lock.lock().await,
        }
    }

    /// Refuse all further cycles and syncs. Requests already queued on the
    /// lock fail with `ApplicationNotFound` once it is released.
    pub fn retire(&self, _held: &SyncGuard<'_>) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> Result<(), ControllerError> {
        if self.retired.load(Ordering::SeqCst) {
            Err(ControllerError::ApplicationNotFound(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Let the next cycle retry a source that failed permanently.
    pub fn request_source_retry(&self) {
        self.retry_source.store(true, Ordering::SeqCst);
    }

    /// One poll cycle: fetch, observe, diff, record the plan, and sync if the
    /// policy calls for it.
    ///
    /// Fetch and observe failures are recorded on the application's state
    /// and returned; the caller keeps polling regardless.
    pub async fn reconcile(&self) -> Result<ApplicationStatus, ControllerError> {
        let store = &self.ctx.store;
        if self.manual_pending.load(Ordering::SeqCst) > 0 {
            tracing::debug!(app = %self.name, "manual sync queued, skipping automatic cycle");
            return store.status(&self.name).await;
        }

        let _guard = self.sync_lock.lock().await;
        self.ensure_active()?;
        if self.manual_pending.load(Ordering::SeqCst) > 0 {
            tracing::debug!(app = %self.name, "superseded by manual sync");
            return store.status(&self.name).await;
        }

        let app = store.get(&self.name).await?;
        let state = store.state(&self.name).await?;
        if state.source_failure.is_some() && !self.retry_source.swap(false, Ordering::SeqCst) {
            tracing::debug!(app = %self.name, "source failed permanently, waiting for an update or hard refresh");
            return Ok(state.status());
        }

        let options = DiffOptions {
            prune: app.sync_policy.prune,
            reapply_in_sync: false,
            ignore_differences: app.ignore_differences.clone(),
        };
        let plan = match self.plan_for(&app, &app.source.target_revision, &options).await {
            Ok(plan) => plan,
            Err(e) => {
                self.record_cycle_error(&app, &e).await?;
                return Err(e);
            }
        };

        self.evict_stale_revisions(&app, &plan.revision).await;

        let policy = &app.sync_policy;
        let new_revision = state
            .last_sync
            .as_ref()
            .is_none_or(|last| last.revision != plan.revision);
        let auto_sync = policy.automated
            && plan.has_changes()
            && (policy.self_heal || new_revision)
            && !self.stop.is_cancelled();

        tracing::debug!(
            app = %self.name,
            revision = %plan.revision,
            creates = plan.count(Action::Create),
            updates = plan.count(Action::Update),
            deletes = plan.count(Action::Delete),
            flagged = plan.flagged().count(),
            "diff complete"
        );

        if auto_sync {
            tracing::info!(app = %self.name, revision = %plan.revision, "automatic sync");
            self.execute_plan(&app, plan, options.prune, Initiator::Automated, true)
                .await?;
        } else {
            store
                .update_state(&self.name, |s| s.record_plan(plan))
                .await?;
        }
        store.status(&self.name).await
    }

    /// Run an explicit sync. Cancels an in-flight automatic sync, then waits
    /// for any other sync to finish and re-diffs before executing.
    pub async fn sync(
        &self,
        request: SyncRequest,
        initiated_by: Initiator,
    ) -> Result<SyncResult, ControllerError> {
        let app = self.ctx.store.get(&self.name).await?;
        if request.revision.is_some() && app.sync_policy.automated {
            return Err(ControllerError::PolicyViolation(format!(
                "{} has automated sync enabled; a revision override would be reverted",
                self.name
            )));
        }

        let _pending = PendingManual::enter(&self.manual_pending);
        self.cancel_automated();
        let _guard = self.sync_lock.lock().await;
        self.ensure_active()?;

        // The application may have been updated while waiting.
        let app = self.ctx.store.get(&self.name).await?;
        let policy = &app.sync_policy;
        let options = DiffOptions {
            prune: request.prune.unwrap_or(policy.prune),
            reapply_in_sync: request.force && !policy.has_option(SyncOption::ApplyOutOfSyncOnly),
            ignore_differences: app.ignore_differences.clone(),
        };
        let target = request
            .revision
            .as_deref()
            .unwrap_or(&app.source.target_revision);

        let plan = self.plan_for(&app, target, &options).await?;
        tracing::info!(
            app = %self.name,
            revision = %plan.revision,
            force = request.force,
            prune = options.prune,
            "manual sync"
        );
        self.execute_plan(&app, plan, options.prune, initiated_by, false)
            .await
    }

    /// Re-sync a revision from retained history.
    pub async fn rollback(&self, revision: &str) -> Result<SyncResult, ControllerError> {
        let app = self.ctx.store.get(&self.name).await?;
        if app.sync_policy.automated {
            return Err(ControllerError::PolicyViolation(format!(
                "cannot roll back {} while automated sync is enabled",
                self.name
            )));
        }
        let entry: HistoryEntry = self.ctx.history.find_revision(&self.name, revision).await?;

        tracing::info!(app = %self.name, revision = %entry.revision, history_id = entry.id, "rolling back");
        let request = SyncRequest {
            revision: Some(entry.revision),
            ..SyncRequest::default()
        };
        self.sync(request, Initiator::Rollback(DEFAULT_OPERATOR.to_string()))
            .await
    }

    /// Dry run: the plan a sync of `revision` (default: the target) would execute.
    pub async fn preview(&self, revision: Option<&str>) -> Result<SyncPlan, ControllerError> {
        let app = self.ctx.store.get(&self.name).await?;
        let options = DiffOptions {
            prune: app.sync_policy.prune,
            reapply_in_sync: false,
            ignore_differences: app.ignore_differences.clone(),
        };
        let target = revision.unwrap_or(&app.source.target_revision);
        self.plan_for(&app, target, &options).await
    }

    /// Cancel the in-flight sync, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.as_ref() {
            Some(run) => {
                tracing::info!(app = %self.name, "cancelling sync");
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_automated(&self) {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = in_flight.as_ref().filter(|r| r.automated) {
            tracing::info!(app = %self.name, "manual sync supersedes automatic sync");
            run.token.cancel();
        }
    }

    /// Delete every live resource carrying this application's tracking
    /// label, dependents before containers.
    pub async fn teardown(
        &self,
        app: &Application,
        _held: &SyncGuard<'_>,
    ) -> Result<SyncResult, ControllerError> {
        let selector = app.tracking_selector(&self.ctx.config.tracking_label);
        let observation = observe(
            self.ctx.backend.as_ref(),
            &app.destination,
            &[],
            &selector,
            &self.ctx.retry,
        )
        .await?;

        let mut plan = diff(&[], &observation.resources, true);
        plan.revision = self
            .ctx
            .store
            .state(&self.name)
            .await?
            .last_sync
            .map(|s| s.revision)
            .unwrap_or_default();

        tracing::info!(app = %self.name, resources = plan.entries.len(), "deleting application resources");
        let cancel = CancellationToken::new();
        let ctx = SyncContext {
            backend: self.ctx.backend.as_ref(),
            destination: &app.destination,
            retry: &self.ctx.retry,
            cancel: &cancel,
        };
        let result = sync::execute(&plan, 0, &ctx).await;
        if let Some((key, reason)) = result.failures().next() {
            return Err(ControllerError::DeleteFailed(format!("{key}: {reason}")));
        }
        Ok(result)
    }

    /// Fetch `target`, observe the destination and diff the two.
    async fn plan_for(
        &self,
        app: &Application,
        target: &str,
        options: &DiffOptions,
    ) -> Result<SyncPlan, ControllerError> {
        let fetched = self
            .ctx
            .fetcher
            .fetch_target(&app.source, target, &app.destination.namespace)
            .await?;

        let selector = app.tracking_selector(&self.ctx.config.tracking_label);
        let mut desired: Vec<DesiredResource> = fetched
            .resources
            .iter()
            .map(|r| r.with_label(&selector))
            .collect();

        // The destination namespace is created when missing but otherwise
        // left alone: it is not labeled and never updated or pruned.
        let mut managed_namespace = None;
        if app.sync_policy.has_option(SyncOption::CreateNamespace) {
            let key = ResourceKey::cluster(ResourceKind::Namespace, &app.destination.namespace);
            if !desired.iter().any(|d| d.key == key) {
                desired.push(DesiredResource {
                    key: key.clone(),
                    manifest: json!({
                        "apiVersion": "v1",
                        "kind": "Namespace",
                        "metadata": { "name": app.destination.namespace },
                    }),
                    revision: fetched.revision.clone(),
                });
                managed_namespace = Some(key);
            }
        }

        let tracked: Vec<ResourceKey> = desired.iter().map(|d| d.key.clone()).collect();
        let observation = observe(
            self.ctx.backend.as_ref(),
            &app.destination,
            &tracked,
            &selector,
            &self.ctx.retry,
        )
        .await?;

        let mut plan = diff_with(&desired, &observation.resources, options);
        plan.revision = fetched.revision;
        if let Some(ns) = managed_namespace {
            plan.entries
                .retain(|e| e.key != ns || e.action == Action::Create);
        }
        Ok(plan)
    }

    /// Record `plan` as the latest diff and execute it. The application is
    /// Progressing from the moment the plan is recorded.
    async fn execute_plan(
        &self,
        app: &Application,
        plan: SyncPlan,
        prune_allowed: bool,
        initiated_by: Initiator,
        automated: bool,
    ) -> Result<SyncResult, ControllerError> {
        sync::validate(&plan, prune_allowed)?;

        let token = self.stop.child_token();
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(InFlight {
            token: token.clone(),
            automated,
        });
        let begun = self
            .ctx
            .store
            .update_state(&self.name, |s| {
                let cycle = s.record_plan(plan.clone());
                s.begin_sync();
                cycle
            })
            .await;
        let cycle = match begun {
            Ok(cycle) => cycle,
            Err(e) => {
                self.clear_in_flight();
                return Err(e);
            }
        };

        tracing::info!(
            app = %self.name,
            revision = %plan.revision,
            entries = plan.actionable().count(),
            "sync started"
        );
        let ctx = SyncContext {
            backend: self.ctx.backend.as_ref(),
            destination: &app.destination,
            retry: &self.ctx.retry,
            cancel: &token,
        };
        let result = sync::execute(&plan, cycle, &ctx).await;
        self.clear_in_flight();

        // Never write history for an application that has been removed.
        self.ctx.store.get(&self.name).await?;
        let appended = self.ctx.history.append(app, &result, initiated_by).await;
        self.ctx
            .store
            .update_state(&self.name, |s| s.record_sync(result.clone()))
            .await?;
        appended?;

        if result.has_failures() {
            tracing::error!(
                app = %self.name,
                revision = %result.revision,
                failed = result.failures().count(),
                "sync completed with failures"
            );
        } else {
            tracing::info!(app = %self.name, revision = %result.revision, cancelled = result.cancelled, "sync completed");
        }
        Ok(result)
    }

    /// Keep cached only the current target and revisions still in history.
    async fn evict_stale_revisions(&self, app: &Application, current: &str) {
        let history = match self.ctx.history.list(&self.name).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(app = %self.name, error = %e, "history unreadable, keeping revision cache");
                return;
            }
        };
        let keep: HashSet<&str> = history
            .iter()
            .map(|e| e.revision.as_str())
            .chain(std::iter::once(current))
            .collect();
        self.ctx.fetcher.retain_revisions(&app.source, &keep).await;
    }

    fn clear_in_flight(&self) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn record_cycle_error(
        &self,
        app: &Application,
        err: &ControllerError,
    ) -> Result<(), ControllerError> {
        let reason = format_err_chain(err);
        match err.class() {
            ErrorClass::PermanentSource => {
                tracing::error!(app = %self.name, target = %app.source.target_revision, error = %reason, "source failed");
                self.ctx
                    .store
                    .update_state(&self.name, |s| {
                        s.record_source_failure(&app.source.target_revision, &reason)
                    })
                    .await
            }
            _ => {
                tracing::warn!(app = %self.name, error = %reason, "reconcile cycle failed");
                self.ctx
                    .store
                    .update_state(&self.name, |s| s.record_transient(&reason))
                    .await
            }
        }
    }
}
