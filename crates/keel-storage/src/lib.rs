//! keel-storage
//!
//! Durable JSON object store on local disk. Keys are `/`-separated relative
//! paths under a root directory; every write is atomic (tmp + rename).

pub mod error;
pub mod objects;
pub mod state;

pub use crate::error::StorageError;
pub use crate::objects::FileStore;
