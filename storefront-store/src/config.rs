//! Connection credentials and access-layer tuning.
//!
//! `StoreSettings` loads from an optional TOML file and is then overridden by
//! `SF_*` environment variables. `ConnectionConfig` mirrors the hosted
//! store's web-app credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Keys of this length or shorter are treated as placeholders.
pub const MIN_API_KEY_LEN: usize = 5;

/// Largest batch the hosted store accepts in a single commit.
pub const MAX_BATCH_CHUNK: usize = 500;

/// Credentials identifying one document store project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
    pub measurement_id: String,
}

impl ConnectionConfig {
    /// Shorthand used by tests and the CLI.
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Defaults baked in at compile time (`SF_API_KEY`, `SF_PROJECT_ID`),
    /// falling back to the local emulator project.
    pub fn compiled_default() -> Self {
        let project_id = option_env!("SF_PROJECT_ID").unwrap_or("storefront-local");
        Self {
            api_key: option_env!("SF_API_KEY")
                .unwrap_or("local-emulator-key")
                .to_string(),
            auth_domain: format!("{project_id}.local"),
            project_id: project_id.to_string(),
            storage_bucket: format!("{project_id}.appspot.local"),
            ..Self::default()
        }
    }

    /// Whether the primary credential is present and not a placeholder.
    pub fn has_usable_key(&self) -> bool {
        self.api_key.trim().len() > MIN_API_KEY_LEN
    }
}

/// Access-layer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Pause after every acknowledged write (ms)
    pub settle_delay_ms: u64,
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// First backoff step (ms); doubled on every retry
    pub base_backoff_ms: u64,
    /// Documents per batch commit
    pub batch_chunk_size: usize,
    /// Buffered change notifications per collection listener
    pub change_capacity: usize,
    /// Root directory for the RocksDB connector
    pub data_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 300,
            max_retries: 5,
            base_backoff_ms: 2000,
            batch_chunk_size: 2,
            change_capacity: 256,
            data_dir: PathBuf::from("storefront_data"),
        }
    }
}

impl StoreSettings {
    /// Settings for tests: no settle pause, millisecond backoff.
    pub fn for_testing() -> Self {
        Self {
            settle_delay_ms: 0,
            base_backoff_ms: 1,
            ..Self::default()
        }
    }

    /// Load `storefront.toml` if present, then apply environment overrides.
    pub fn load() -> StoreResult<Self> {
        let mut settings = match Self::from_file("storefront.toml") {
            Ok(settings) => settings,
            Err(_) => Self::default(),
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoreError::Configuration(format!("Failed to read settings file: {e}"))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> StoreResult<Self> {
        let settings: Self = toml::from_str(contents).map_err(|e| {
            StoreError::Configuration(format!("Failed to parse settings file: {e}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> StoreResult<()> {
        use std::env;

        if let Ok(v) = env::var("SF_SETTLE_DELAY_MS") {
            self.settle_delay_ms = parse_env("SF_SETTLE_DELAY_MS", &v)?;
        }
        if let Ok(v) = env::var("SF_MAX_RETRIES") {
            self.max_retries = parse_env("SF_MAX_RETRIES", &v)?;
        }
        if let Ok(v) = env::var("SF_BASE_BACKOFF_MS") {
            self.base_backoff_ms = parse_env("SF_BASE_BACKOFF_MS", &v)?;
        }
        if let Ok(v) = env::var("SF_BATCH_CHUNK_SIZE") {
            self.batch_chunk_size = parse_env("SF_BATCH_CHUNK_SIZE", &v)?;
        }
        if let Ok(v) = env::var("SF_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }

    /// Reject settings the access layer cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.batch_chunk_size == 0 || self.batch_chunk_size > MAX_BATCH_CHUNK {
            return Err(StoreError::Configuration(format!(
                "batch_chunk_size must be between 1 and {MAX_BATCH_CHUNK}"
            )));
        }
        if self.change_capacity == 0 {
            return Err(StoreError::Configuration(
                "change_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StoreError::Configuration(format!("Invalid {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_key_threshold() {
        assert!(!ConnectionConfig::new("short", "p").has_usable_key());
        assert!(!ConnectionConfig::new("   abc   ", "p").has_usable_key());
        assert!(ConnectionConfig::new("a-valid-long-key", "p").has_usable_key());
        assert!(ConnectionConfig::compiled_default().has_usable_key());
    }

    #[test]
    fn test_settings_default() {
        let settings = StoreSettings::default();
        assert_eq!(settings.settle_delay(), Duration::from_millis(300));
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.base_backoff(), Duration::from_millis(2000));
        assert_eq!(settings.batch_chunk_size, 2);
    }

    #[test]
    fn test_settings_from_toml_partial() {
        let settings = StoreSettings::from_toml("batch_chunk_size = 450\nsettle_delay_ms = 50\n")
            .unwrap();
        assert_eq!(settings.batch_chunk_size, 450);
        assert_eq!(settings.settle_delay_ms, 50);
        assert_eq!(settings.max_retries, 5);
    }

    #[test]
    fn test_settings_rejects_zero_chunk() {
        let err = StoreSettings::from_toml("batch_chunk_size = 0").unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn test_connection_config_camel_case() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"apiKey":"abcdefgh","projectId":"shop"}"#).unwrap();
        assert_eq!(config.api_key, "abcdefgh");
        assert_eq!(config.project_id, "shop");
        assert!(config.app_id.is_empty());
    }
}
