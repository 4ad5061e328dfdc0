use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::plan::SyncPlan;
use crate::models::sync_result::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Unknown,
    Synced,
    OutOfSync,
    Progressing,
    Degraded,
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Synced => "Synced",
            Self::OutOfSync => "OutOfSync",
            Self::Progressing => "Progressing",
            Self::Degraded => "Degraded",
        };
        f.write_str(s)
    }
}

/// The most recent completed diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub cycle: u64,
    pub plan: SyncPlan,
    pub computed_at: jiff::Timestamp,
}

/// A permanent source error (revision or path not found) for the current spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub target_revision: String,
    pub reason: String,
    pub at: jiff::Timestamp,
}

/// Everything the controller knows about an application's reconciliation.
///
/// Status is never stored: [`ApplicationState::status`] derives it from the
/// last plan, the last sync result, the in-flight flag and any permanent
/// source failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationState {
    /// Last cycle number handed out.
    #[serde(default)]
    pub cycle: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_plan: Option<PlanRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SyncResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_failure: Option<SourceFailure>,
    /// Last transient error; informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Not persisted: a restarted controller has nothing in flight.
    #[serde(skip)]
    pub progressing: bool,
}

impl ApplicationState {
    pub fn status(&self) -> ApplicationStatus {
        if self.progressing {
            return ApplicationStatus::Progressing;
        }
        if self.source_failure.is_some() {
            return ApplicationStatus::Degraded;
        }
        let Some(plan) = &self.last_plan else {
            return ApplicationStatus::Unknown;
        };
        match &self.last_sync {
            Some(sync) if sync.cycle >= plan.cycle => match sync.status() {
                // Unpruned leftovers are still drift after a clean run.
                ApplicationStatus::Synced if plan.plan.flagged().next().is_some() => {
                    ApplicationStatus::OutOfSync
                }
                status => status,
            },
            last_sync => {
                if plan.plan.is_empty() {
                    ApplicationStatus::Synced
                } else if last_sync.as_ref().is_some_and(|s| s.has_failures()) {
                    ApplicationStatus::Degraded
                } else {
                    ApplicationStatus::OutOfSync
                }
            }
        }
    }

    /// Record a completed diff; returns its cycle number.
    pub fn record_plan(&mut self, plan: SyncPlan) -> u64 {
        self.cycle += 1;
        self.last_plan = Some(PlanRecord {
            cycle: self.cycle,
            plan,
            computed_at: jiff::Timestamp::now(),
        });
        self.source_failure = None;
        self.last_error = None;
        self.cycle
    }

    pub fn begin_sync(&mut self) {
        self.progressing = true;
    }

    pub fn record_sync(&mut self, result: SyncResult) {
        self.progressing = false;
        self.last_sync = Some(result);
    }

    pub fn record_source_failure(&mut self, target_revision: &str, reason: &str) {
        self.source_failure = Some(SourceFailure {
            target_revision: target_revision.to_string(),
            reason: reason.to_string(),
            at: jiff::Timestamp::now(),
        });
    }

    pub fn record_transient(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
    }

    /// Human-readable cause for a Degraded or Unknown status.
    pub fn cause(&self) -> Option<String> {
        if let Some(failure) = &self.source_failure {
            return Some(failure.reason.clone());
        }
        if let Some(sync) = &self.last_sync {
            let reasons: Vec<String> = sync
                .failures()
                .map(|(key, reason)| format!("{key}: {reason}"))
                .collect();
            if !reasons.is_empty() {
                return Some(reasons.join("; "));
            }
        }
        self.last_error.clone()
    }
}
