//! Source-of-truth access: resolving revisions and listing resource documents.

pub mod directory;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::ControllerError;

pub use directory::DirectorySource;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A render-complete resource document as stored at a revision.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// Where the document came from, for error messages.
    pub file: String,
    pub manifest: Value,
}

/// Read-only access to a version-controlled desired-state repository.
///
/// Methods return boxed futures for dyn compatibility.
pub trait SourceRepo: Send + Sync {
    /// Resolve a symbolic target (branch, tag, `HEAD`) to an immutable revision.
    fn resolve<'a>(
        &'a self,
        repo_url: &'a str,
        target: &'a str,
    ) -> BoxFuture<'a, Result<String, ControllerError>> {
        let _ = repo_url;
        Box::pin(async move { Ok(target.to_string()) })
    }

    /// Every document under `path` at `revision`.
    ///
    /// Fails with `SourceUnavailable` (transient) or `RevisionNotFound`.
    /// Identical arguments always yield identical documents.
    fn list_resources<'a>(
        &'a self,
        repo_url: &'a str,
        path: &'a str,
        revision: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SourceDocument>, ControllerError>>;
}
