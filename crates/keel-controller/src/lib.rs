//! keel-controller
//!
//! Continuous reconciliation of declared applications against an
//! orchestration backend. Library consumed by an embedding binary, which
//! supplies the source repository and backend implementations.
//!
//! Public API:
//! - `Controller`: application lifecycle, status, sync, rollback, history
//! - `fetcher`: resolve and fetch desired state, cached per revision
//! - `observe()`: snapshot live state plus prune candidates
//! - `diff()`: pure desired-vs-live comparison into an ordered plan
//! - `sync::execute()`: apply a plan in order, entry-scoped failures

pub mod backend;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod observe;
pub mod reconcile;
pub mod retry;
pub mod source;
pub mod store;
pub mod sync;
pub mod worker;

pub use crate::backend::ClusterBackend;
pub use crate::config::{ControllerConfig, load_config, save_config};
pub use crate::controller::Controller;
pub use crate::diff::{DiffOptions, diff, diff_with};
pub use crate::error::{ControllerError, ErrorClass};
pub use crate::observe::{Observation, observe};
pub use crate::reconcile::SyncRequest;
pub use crate::retry::RetryPolicy;
pub use crate::source::{BoxFuture, DirectorySource, SourceDocument, SourceRepo};
