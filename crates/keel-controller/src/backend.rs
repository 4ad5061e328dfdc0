use keel_core::models::{DesiredResource, Destination, LabelSelector, LiveObject, ResourceKey};
use serde_json::Value;

use crate::error::ControllerError;
use crate::source::BoxFuture;

/// The orchestration backend a destination lives on.
///
/// Implementations must be safe for concurrent use by every application's
/// loop. Methods return boxed futures for dyn compatibility.
pub trait ClusterBackend: Send + Sync {
    /// Current state of one resource. Absence is `Ok(LiveObject::NotFound)`,
    /// never an error.
    fn get<'a>(
        &'a self,
        destination: &'a Destination,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, Result<LiveObject, ControllerError>>;

    /// Create or update `resource` to match its manifest. Returns the live object.
    fn apply<'a>(
        &'a self,
        destination: &'a Destination,
        resource: &'a DesiredResource,
    ) -> BoxFuture<'a, Result<Value, ControllerError>>;

    /// Delete a resource. Returns `false` if it was already absent.
    fn delete<'a>(
        &'a self,
        destination: &'a Destination,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, Result<bool, ControllerError>>;

    /// Keys of every live resource carrying `selector`.
    fn list_by_label<'a>(
        &'a self,
        destination: &'a Destination,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, Result<Vec<ResourceKey>, ControllerError>>;
}
