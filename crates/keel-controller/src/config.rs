use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::retry::RetryPolicy;

/// Current config version. Bump this when adding fields or changing shape.
/// Each bump requires a corresponding entry in [`migrate`].
const CURRENT_VERSION: u32 = 1;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_TRACKING_LABEL: &str = "app.kubernetes.io/instance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Schema version. Missing or 0 = pre-versioned config.
    #[serde(default)]
    pub config_version: u32,
    /// Idle time between reconciliation cycles of one application.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on any single fetch, observe or apply call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    /// History entries retained per application.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Root directory for application specs, status and history.
    pub state_dir: PathBuf,
    /// Label stamped on every applied resource and used to find prune candidates.
    #[serde(default = "default_tracking_label")]
    pub tracking_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_tracking_label() -> String {
    DEFAULT_TRACKING_LABEL.to_string()
}

impl ControllerConfig {
    /// Defaults rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_version: CURRENT_VERSION,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            retry: RetrySettings::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            state_dir: state_dir.into(),
            tracking_label: DEFAULT_TRACKING_LABEL.to_string(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.poll_interval_secs == 0 {
            return Err(ControllerError::Config(
                "poll_interval_secs must be positive".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ControllerError::Config(
                "call_timeout_secs must be positive".into(),
            ));
        }
        if self.history_limit == 0 {
            return Err(ControllerError::Config("history_limit must be positive".into()));
        }
        if self.tracking_label.is_empty() {
            return Err(ControllerError::Config("tracking_label must not be empty".into()));
        }
        Ok(())
    }
}

/// Platform default state directory, e.g. `~/.local/share/keel`.
pub fn default_state_dir() -> Result<PathBuf, ControllerError> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| ControllerError::Config("no data directory found".into()))?;
    Ok(base.join("keel"))
}

pub fn load_config(path: &Path) -> Result<ControllerConfig, ControllerError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ControllerError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;

    // Parse as raw JSON so we can run migrations before deserializing.
    let json: serde_json::Value = serde_json::from_str(&contents)?;
    let on_disk_version = json
        .get("config_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;

    let migrated = migrate(json, on_disk_version)?;
    let config: ControllerConfig = serde_json::from_value(migrated)?;
    config.validate()?;
    Ok(config)
}

/// Run sequential migrations from `from_version` up to [`CURRENT_VERSION`].
fn migrate(
    mut json: serde_json::Value,
    from_version: u32,
) -> Result<serde_json::Value, ControllerError> {
    if from_version > CURRENT_VERSION {
        return Err(ControllerError::Config(format!(
            "config_version {from_version} is newer than this build supports ({CURRENT_VERSION})"
        )));
    }

    // Unversioned (hand-written) config: stamp v1 and fill in the state dir.
    if from_version < 1 {
        let obj = json
            .as_object_mut()
            .ok_or_else(|| ControllerError::Config("config is not a JSON object".into()))?;
        if !obj.contains_key("state_dir") {
            let dir = default_state_dir()?;
            obj.insert(
                "state_dir".to_string(),
                serde_json::Value::String(dir.to_string_lossy().into_owned()),
            );
        }
        obj.insert(
            "config_version".to_string(),
            serde_json::Value::Number(1.into()),
        );
        tracing::info!("stamped unversioned config as v1");
    }

    Ok(json)
}

pub fn save_config(path: &Path, config: &ControllerConfig) -> Result<(), ControllerError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    // Always write the current version, regardless of what was loaded.
    let mut stamped = config.clone();
    stamped.config_version = CURRENT_VERSION;

    let json = serde_json::to_string_pretty(&stamped)?;

    // Write to a temp file then rename for atomicity
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())?;
    std::fs::rename(&tmp_path, path)?;

    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
