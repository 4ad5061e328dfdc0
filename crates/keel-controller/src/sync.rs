//! Sync executor: applies a plan against the backend in plan order.
//!
//! A failed entry never aborts the run. Later entries that structurally
//! depend on it (resources in a namespace whose creation failed, instances
//! of a custom type whose definition failed) are skipped instead of
//! attempted. Re-running a partially applied plan is safe: apply is an
//! upsert and deleting an absent resource succeeds.

use std::collections::HashSet;

use keel_core::models::{
    Action, DesiredResource, Destination, DiffEntry, Outcome, ResourceKind, ResourceResult,
    SyncPlan, SyncResult,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::ClusterBackend;
use crate::error::{ControllerError, format_err_chain};
use crate::retry::RetryPolicy;

/// Everything one sync run needs besides the plan.
pub struct SyncContext<'a> {
    pub backend: &'a dyn ClusterBackend,
    pub destination: &'a Destination,
    pub retry: &'a RetryPolicy,
    /// Checked before each entry.
    pub cancel: &'a CancellationToken,
}

/// Reject a plan the policy does not allow, before anything touches the backend.
pub fn validate(plan: &SyncPlan, prune_allowed: bool) -> Result<(), ControllerError> {
    if !prune_allowed {
        if let Some(entry) = plan.entries.iter().find(|e| e.action == Action::Delete) {
            return Err(ControllerError::PolicyViolation(format!(
                "plan deletes {} but pruning is disabled",
                entry.key
            )));
        }
    }
    Ok(())
}

/// Resources whose failure blocks dependents later in the plan.
#[derive(Default)]
struct Blockers {
    namespaces: HashSet<String>,
    kinds: HashSet<ResourceKind>,
}

impl Blockers {
    fn record(&mut self, entry: &DiffEntry) {
        match entry.key.kind {
            ResourceKind::Namespace => {
                self.namespaces.insert(entry.key.name.clone());
            }
            ResourceKind::CustomResourceDefinition => {
                let declared = entry
                    .desired
                    .as_ref()
                    .and_then(|m| m.pointer("/spec/names/kind"))
                    .and_then(Value::as_str);
                if let Some(kind) = declared {
                    self.kinds.insert(ResourceKind::from(kind));
                }
            }
            _ => {}
        }
    }

    fn blocking(&self, entry: &DiffEntry) -> Option<String> {
        if let Some(ns) = &entry.key.namespace {
            if self.namespaces.contains(ns) {
                return Some(format!("namespace {ns} failed to apply"));
            }
        }
        if self.kinds.contains(&entry.key.kind) {
            return Some(format!("definition of {} failed to apply", entry.key.kind));
        }
        None
    }
}

/// Apply every entry of `plan` in order.
pub async fn execute(plan: &SyncPlan, cycle: u64, ctx: &SyncContext<'_>) -> SyncResult {
    let started_at = jiff::Timestamp::now();
    let mut results = Vec::with_capacity(plan.entries.len());
    let mut blockers = Blockers::default();
    let mut cancelled = false;

    for entry in &plan.entries {
        if !cancelled && ctx.cancel.is_cancelled() {
            tracing::warn!(revision = %plan.revision, "sync cancelled, leaving remaining entries");
            cancelled = true;
        }

        let blocked = match entry.action {
            Action::Create | Action::Update => blockers.blocking(entry),
            _ => None,
        };

        let outcome = if cancelled {
            Outcome::Cancelled
        } else if entry.action == Action::NoOp {
            Outcome::Skipped("pruning disabled".into())
        } else if let Some(reason) = blocked {
            tracing::warn!(key = %entry.key, reason = %reason, "skipping dependent resource");
            Outcome::Skipped(reason)
        } else {
            let outcome = apply_entry(entry, &plan.revision, ctx).await;
            if matches!(outcome, Outcome::Failed(_)) && entry.action != Action::Delete {
                blockers.record(entry);
            }
            outcome
        };

        results.push(ResourceResult {
            key: entry.key.clone(),
            action: entry.action,
            outcome,
        });
    }

    let result = SyncResult {
        operation_id: Uuid::new_v4(),
        revision: plan.revision.clone(),
        cycle,
        results,
        cancelled,
        started_at,
        finished_at: jiff::Timestamp::now(),
    };

    tracing::info!(
        revision = %result.revision,
        applied = result.applied(),
        failed = result.failures().count(),
        skipped = result.skipped(),
        cancelled = result.cancelled,
        "sync finished"
    );
    result
}

async fn apply_entry(entry: &DiffEntry, revision: &str, ctx: &SyncContext<'_>) -> Outcome {
    match entry.action {
        Action::Create | Action::Update => {
            let Some(manifest) = entry.desired.clone() else {
                return Outcome::Failed("plan entry has no desired manifest".into());
            };
            let resource = DesiredResource {
                key: entry.key.clone(),
                manifest,
                revision: revision.to_string(),
            };
            tracing::debug!(key = %entry.key, action = ?entry.action, "applying resource");
            match ctx
                .retry
                .run("apply", || ctx.backend.apply(ctx.destination, &resource))
                .await
            {
                Ok(_) => Outcome::Applied,
                Err(e) => {
                    let reason = format_err_chain(&e);
                    tracing::error!(key = %entry.key, error = %reason, "apply failed");
                    Outcome::Failed(reason)
                }
            }
        }
        Action::Delete => {
            tracing::debug!(key = %entry.key, "deleting resource");
            match ctx
                .retry
                .run("delete", || ctx.backend.delete(ctx.destination, &entry.key))
                .await
            {
                Ok(existed) => {
                    if !existed {
                        tracing::debug!(key = %entry.key, "resource already absent");
                    }
                    Outcome::Applied
                }
                Err(e) => {
                    let reason = format_err_chain(&e);
                    tracing::error!(key = %entry.key, error = %reason, "delete failed");
                    Outcome::Failed(reason)
                }
            }
        }
        Action::NoOp => Outcome::Skipped("nothing to do".into()),
    }
}
