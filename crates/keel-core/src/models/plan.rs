use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::resource::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

/// Structured before/after for a single field that doesn't match desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDrift {
    /// JSON pointer of the field, e.g. "/spec/replicas"
    pub field: String,
    /// What the revision declares
    pub expected: Value,
    /// What the backend has
    pub actual: Value,
}

/// One resource's classification in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: ResourceKey,
    pub action: Action,
    /// Live resource absent from desired state that was not scheduled for
    /// deletion because pruning is off. Action is always `NoOp`.
    #[serde(default)]
    pub flagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<FieldDrift>,
}

impl DiffEntry {
    pub fn rank(&self) -> u8 {
        self.key.rank()
    }

    /// Whether executing this entry touches the backend.
    pub fn is_actionable(&self) -> bool {
        self.action != Action::NoOp
    }

    /// Whether this entry makes the application OutOfSync.
    pub fn is_drift(&self) -> bool {
        self.is_actionable() || self.flagged
    }
}

/// An ordered sync plan for one application at one revision.
///
/// Creates and updates come first in ascending rank, deletes follow in
/// descending rank; ties break on `ResourceKey`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub revision: String,
    pub entries: Vec<DiffEntry>,
}

impl SyncPlan {
    /// No create, update, delete or flagged drift.
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(DiffEntry::is_drift)
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(DiffEntry::is_actionable)
    }

    pub fn actionable(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| e.is_actionable())
    }

    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    pub fn flagged(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| e.flagged)
    }
}
