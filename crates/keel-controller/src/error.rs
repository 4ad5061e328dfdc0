use thiserror::Error;

/// How an error is handled by the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network or backend unavailability: retried with backoff.
    Transient,
    /// Revision or path not found: Degraded until the spec changes.
    PermanentSource,
    /// The backend rejected one resource: recorded on that entry only.
    ApplyFailure,
    /// Rejected before execution, no side effects.
    PolicyViolation,
    Internal,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("revision not found: {revision}")]
    RevisionNotFound { revision: String },

    #[error("path not found: {path} at {revision}")]
    PathNotFound { path: String, revision: String },

    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("application already exists: {0}")]
    ApplicationExists(String),

    #[error("invalid resource document {file}: {reason}")]
    InvalidDocument { file: String, reason: String },

    #[error("controller is not running")]
    NotRunning,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] keel_core::CoreError),

    #[error(transparent)]
    Storage(#[from] keel_storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SourceUnavailable(_) | Self::DestinationUnreachable(_) | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::RevisionNotFound { .. }
            | Self::PathNotFound { .. }
            | Self::InvalidDocument { .. } => ErrorClass::PermanentSource,
            Self::ApplyFailed(_) | Self::DeleteFailed(_) => ErrorClass::ApplyFailure,
            Self::PolicyViolation(_) => ErrorClass::PolicyViolation,
            _ => ErrorClass::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Prepend resource identity to the error message.
    pub fn with_resource(self, key: &impl std::fmt::Display) -> Self {
        match self {
            Self::ApplyFailed(msg) => Self::ApplyFailed(format!("{key}: {msg}")),
            Self::DeleteFailed(msg) => Self::DeleteFailed(format!("{key}: {msg}")),
            Self::DestinationUnreachable(msg) => {
                Self::DestinationUnreachable(format!("{key}: {msg}"))
            }
            other => other,
        }
    }
}

/// Walk the full error chain and join all causes into one string.
///
/// Backend errors often have terse `Display` impls but useful detail in the
/// source chain. A cause whose text already appears in the message (wrappers
/// that print `{0}`) is not repeated.
pub fn format_err_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !msg.contains(&text) {
            msg.push_str(": ");
            msg.push_str(&text);
        }
        source = cause.source();
    }
    msg
}
