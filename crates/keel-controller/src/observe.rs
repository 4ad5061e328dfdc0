//! Live-state observer: snapshots every resource an application tracks, plus
//! any live resource carrying its tracking label.

use std::collections::BTreeSet;

use futures::future::try_join_all;
use keel_core::models::{Destination, LabelSelector, ObservedResource, ResourceKey};

use crate::backend::ClusterBackend;
use crate::error::ControllerError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// One entry per tracked key (possibly `NotFound`) and per live prune candidate.
    pub resources: Vec<ObservedResource>,
    /// Live labeled resources that were not in the tracked set.
    pub prune_candidates: Vec<ResourceKey>,
}

/// Observe `tracked` on `destination`.
///
/// Fails with `DestinationUnreachable` if the backend cannot be queried; a
/// missing resource is an observed value, not a failure.
pub async fn observe(
    backend: &dyn ClusterBackend,
    destination: &Destination,
    tracked: &[ResourceKey],
    selector: &LabelSelector,
    retry: &RetryPolicy,
) -> Result<Observation, ControllerError> {
    let labeled = retry
        .run("list by label", || backend.list_by_label(destination, selector))
        .await
        .map_err(as_unreachable)?;

    let tracked_set: BTreeSet<&ResourceKey> = tracked.iter().collect();
    let candidates: Vec<ResourceKey> = labeled
        .into_iter()
        .filter(|k| !tracked_set.contains(k))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let keys: Vec<&ResourceKey> = tracked_set.iter().copied().chain(candidates.iter()).collect();
    let lookups = keys.iter().map(|key| async move {
        let live = retry
            .run("get resource", || backend.get(destination, key))
            .await
            .map_err(|e| as_unreachable(e).with_resource(*key))?;
        Ok::<_, ControllerError>(ObservedResource {
            key: (*key).clone(),
            live,
        })
    });
    let observed = try_join_all(lookups).await?;

    // A candidate that vanished between list and get is not a candidate.
    let mut prune_candidates = Vec::new();
    let resources = observed
        .into_iter()
        .filter(|r| {
            if tracked_set.contains(&r.key) {
                return true;
            }
            if r.live.is_present() {
                prune_candidates.push(r.key.clone());
                true
            } else {
                false
            }
        })
        .collect();

    tracing::debug!(
        namespace = %destination.namespace,
        tracked = tracked.len(),
        candidates = prune_candidates.len(),
        "live state observed"
    );

    Ok(Observation {
        resources,
        prune_candidates,
    })
}

fn as_unreachable(err: ControllerError) -> ControllerError {
    match err {
        e @ ControllerError::DestinationUnreachable(_) => e,
        e => ControllerError::DestinationUnreachable(e.to_string()),
    }
}
