//! keel-core
//!
//! Pure domain types for the keel reconciliation controller: applications,
//! resource identity, plans, sync outcomes, history and status derivation.
//! Nothing here touches the network or the disk.

pub mod error;
pub mod models;
pub mod normalize;

pub use crate::error::CoreError;
