use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::plan::Action;
use crate::models::resource::ResourceKey;
use crate::models::status::ApplicationStatus;

/// What happened to one plan entry during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Failed(String),
    Skipped(String),
    /// Not attempted because the sync was cancelled first.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub action: Action,
    pub outcome: Outcome,
}

/// Outcome of one sync execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub operation_id: Uuid,
    pub revision: String,
    /// Reconciliation cycle whose plan this sync executed.
    pub cycle: u64,
    pub results: Vec<ResourceResult>,
    /// The run was cancelled part-way; applied entries stay in place.
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: jiff::Timestamp,
    pub finished_at: jiff::Timestamp,
}

impl SyncResult {
    pub fn has_failures(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.outcome, Outcome::Failed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ResourceKey, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Failed(reason) => Some((&r.key, reason.as_str())),
            _ => None,
        })
    }

    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Applied)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped(_) | Outcome::Cancelled))
            .count()
    }

    pub fn outcome_of(&self, key: &ResourceKey) -> Option<&Outcome> {
        self.results.iter().find(|r| &r.key == key).map(|r| &r.outcome)
    }

    /// Application status implied by this run alone.
    pub fn status(&self) -> ApplicationStatus {
        if self.has_failures() {
            ApplicationStatus::Degraded
        } else if self.cancelled {
            ApplicationStatus::OutOfSync
        } else {
            ApplicationStatus::Synced
        }
    }
}
