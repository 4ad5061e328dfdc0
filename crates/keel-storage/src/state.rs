use serde::{Serialize, de::DeserializeOwned};

use crate::error::StorageError;
use crate::objects::FileStore;

/// Load a JSON state file.
pub async fn load_state<T: DeserializeOwned>(
    store: &FileStore,
    key: &str,
) -> Result<T, StorageError> {
    let body = store.get_object(key).await?;
    let value: T = serde_json::from_slice(&body)?;
    Ok(value)
}

/// Load a JSON state file, or `None` if it has never been written.
pub async fn load_state_opt<T: DeserializeOwned>(
    store: &FileStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match load_state(store, key).await {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Save a JSON state file.
pub async fn save_state<T: Serialize>(
    store: &FileStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(value)?;
    store.put_object(key, &body).await
}
