use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::resource::{LabelSelector, ResourceKind};

/// A declared application: where its desired state lives, where it is
/// deployed, and how reconciliation behaves.
///
/// Owned by the controller. A sync mutates the application's status, never
/// this spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub source: SourceRef,
    pub destination: Destination,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Extra fields excluded from comparison, on top of each kind's built-in set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<IgnoreRule>,
    /// Overrides the controller's polling interval for this application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

impl Application {
    pub fn validate(&self) -> Result<(), CoreError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid_name {
            return Err(CoreError::InvalidApplication(format!(
                "invalid application name: {:?}",
                self.name
            )));
        }
        if self.source.repo_url.is_empty() {
            return Err(CoreError::MissingField("source.repo_url".into()));
        }
        if self.source.target_revision.is_empty() {
            return Err(CoreError::MissingField("source.target_revision".into()));
        }
        if self.destination.namespace.is_empty() {
            return Err(CoreError::MissingField("destination.namespace".into()));
        }
        if self.poll_interval_secs == Some(0) {
            return Err(CoreError::InvalidApplication(
                "poll_interval_secs must be positive".into(),
            ));
        }
        for rule in &self.ignore_differences {
            if !rule.pointer.starts_with('/') {
                return Err(CoreError::InvalidApplication(format!(
                    "ignore pointer must start with '/': {}",
                    rule.pointer
                )));
            }
        }
        Ok(())
    }

    /// Selector that identifies every live resource this application owns.
    pub fn tracking_selector(&self, label_key: &str) -> LabelSelector {
        LabelSelector::new(label_key, &self.name)
    }
}

/// Where the desired state lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub repo_url: String,
    #[serde(default)]
    pub path: String,
    /// Branch, tag or commit. Symbolic targets are resolved before fetching.
    pub target_revision: String,
}

/// Where the application is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub cluster: String,
    pub namespace: String,
}

/// Immutable description of how reconciliation behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Sync automatically when the application is OutOfSync.
    #[serde(default)]
    pub automated: bool,
    /// Correct live drift without waiting for a new revision.
    #[serde(default)]
    pub self_heal: bool,
    /// Delete live resources absent from desired state.
    #[serde(default)]
    pub prune: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sync_options: BTreeSet<SyncOption>,
}

impl SyncPolicy {
    pub fn has_option(&self, option: SyncOption) -> bool {
        self.sync_options.contains(&option)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOption {
    /// Create the destination namespace if it does not exist.
    CreateNamespace,
    /// A forced sync only re-applies resources that are out of sync.
    ApplyOutOfSyncOnly,
}

/// A field to exclude from comparison, as an RFC 6901 JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreRule {
    /// Restrict the rule to one kind; `None` applies to all kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
    pub pointer: String,
}
