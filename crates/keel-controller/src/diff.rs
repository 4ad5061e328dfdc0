//! The differ: a pure comparison of desired against observed state that
//! yields an ordered sync plan.
//!
//! Creates and updates run in ascending dependency rank (containers before
//! dependents); deletes run afterwards in descending rank (dependents before
//! containers). Within a rank entries are ordered by `ResourceKey`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use keel_core::models::{
    Action, DesiredResource, DiffEntry, IgnoreRule, ObservedResource, ResourceKey, ResourceKind,
    SyncPlan,
};
use keel_core::normalize::{IgnoreSet, field_drift};

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Schedule deletion of live resources absent from desired state.
    pub prune: bool,
    /// Re-apply resources that are already in sync (forced sync).
    pub reapply_in_sync: bool,
    /// Extra fields excluded from comparison.
    pub ignore_differences: Vec<IgnoreRule>,
}

/// Diff with built-in normalization rules only.
pub fn diff(desired: &[DesiredResource], observed: &[ObservedResource], prune: bool) -> SyncPlan {
    diff_with(
        desired,
        observed,
        &DiffOptions {
            prune,
            ..DiffOptions::default()
        },
    )
}

pub fn diff_with(
    desired: &[DesiredResource],
    observed: &[ObservedResource],
    options: &DiffOptions,
) -> SyncPlan {
    let live: BTreeMap<&ResourceKey, &ObservedResource> =
        observed.iter().map(|o| (&o.key, o)).collect();
    let desired_keys: HashSet<&ResourceKey> = desired.iter().map(|d| &d.key).collect();

    let mut applies = Vec::new();
    for resource in desired {
        let live_object = live.get(&resource.key).and_then(|o| o.live.as_value());
        let Some(live_object) = live_object else {
            applies.push(DiffEntry {
                key: resource.key.clone(),
                action: Action::Create,
                flagged: false,
                desired: Some(resource.manifest.clone()),
                observed: None,
                drift: vec![],
            });
            continue;
        };

        let ignore = ignore_set(&resource.key.kind, &options.ignore_differences);
        let want = ignore.normalize(&resource.manifest);
        let have = ignore.normalize(live_object);
        let drift = if want == have {
            vec![]
        } else {
            field_drift(&want, &have)
        };

        if drift.is_empty() && !options.reapply_in_sync {
            continue;
        }
        applies.push(DiffEntry {
            key: resource.key.clone(),
            action: Action::Update,
            flagged: false,
            desired: Some(resource.manifest.clone()),
            observed: Some(live_object.clone()),
            drift,
        });
    }

    let mut deletes = Vec::new();
    let mut flagged = Vec::new();
    for (key, obs) in &live {
        if desired_keys.contains(key) {
            continue;
        }
        let Some(live_object) = obs.live.as_value() else {
            continue;
        };
        let entry = DiffEntry {
            key: (*key).clone(),
            action: if options.prune {
                Action::Delete
            } else {
                Action::NoOp
            },
            flagged: !options.prune,
            desired: None,
            observed: Some(live_object.clone()),
            drift: vec![],
        };
        if options.prune {
            deletes.push(entry);
        } else {
            flagged.push(entry);
        }
    }

    applies.sort_by(|a, b| (a.rank(), &a.key).cmp(&(b.rank(), &b.key)));
    deletes.sort_by(|a, b| (Reverse(a.rank()), &a.key).cmp(&(Reverse(b.rank()), &b.key)));
    flagged.sort_by(|a, b| (a.rank(), &a.key).cmp(&(b.rank(), &b.key)));

    let revision = desired
        .first()
        .map(|d| d.revision.clone())
        .unwrap_or_default();
    let mut entries = applies;
    entries.extend(deletes);
    entries.extend(flagged);
    SyncPlan { revision, entries }
}

/// Built-in ignore-set for `kind` plus the rules that apply to it.
pub fn ignore_set(kind: &ResourceKind, rules: &[IgnoreRule]) -> IgnoreSet {
    let mut set = IgnoreSet::for_kind(kind);
    set.extend(
        rules
            .iter()
            .filter(|r| r.kind.as_ref().is_none_or(|k| k == kind))
            .map(|r| r.pointer.as_str()),
    );
    set
}
