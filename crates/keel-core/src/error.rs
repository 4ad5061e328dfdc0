use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid resource document: {0}")]
    InvalidResource(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid application: {0}")]
    InvalidApplication(String),
}
