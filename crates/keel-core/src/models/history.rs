use serde::{Deserialize, Serialize};

use crate::models::application::SourceRef;
use crate::models::resource::ResourceKey;
use crate::models::sync_result::SyncResult;

/// Who asked for a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Initiator {
    /// The reconciliation loop, under an automated policy.
    Automated,
    /// An explicit sync request.
    Operator(String),
    /// A rollback to an earlier revision.
    Rollback(String),
}

/// Per-run counts plus the reason behind every failed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: Vec<(ResourceKey, String)>,
    #[serde(default)]
    pub cancelled: bool,
}

impl From<&SyncResult> for SyncSummary {
    fn from(result: &SyncResult) -> Self {
        Self {
            applied: result.applied(),
            skipped: result.skipped(),
            failed: result
                .failures()
                .map(|(key, reason)| (key.clone(), reason.to_string()))
                .collect(),
            cancelled: result.cancelled,
        }
    }
}

/// One completed sync, appended to an application's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonic per application, starting at 1.
    pub id: u64,
    pub revision: String,
    pub source: SourceRef,
    pub deployed_at: jiff::Timestamp,
    pub initiated_by: Initiator,
    pub summary: SyncSummary,
}

impl HistoryEntry {
    pub fn succeeded(&self) -> bool {
        self.summary.failed.is_empty() && !self.summary.cancelled
    }
}
