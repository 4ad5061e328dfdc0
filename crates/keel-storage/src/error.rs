use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("invalid key: {key}")]
    InvalidKey { key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("read error for {key}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write error for {key}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("delete error for {key}")]
    Delete {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("list error for {prefix}")]
    List {
        prefix: String,
        #[source]
        source: std::io::Error,
    },
}
