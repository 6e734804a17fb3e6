use octorouter_pipeline::PipelineSettings;
use octorouter_pipeline::context::{DEFAULT_OBSERVATION_MAPPING_TABLE, DEFAULT_SHORTHAND_TABLE};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "octorouter.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    /// Sender and receiver settings
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Pipeline validations
        let p = &self.pipeline;
        if p.poll_interval_ms == 0 {
            return Err("pipeline.poll_interval_ms must be > 0".into());
        }
        if p.batch_size == 0 {
            return Err("pipeline.batch_size must be > 0".into());
        }
        if p.visibility_timeout_secs == 0 || p.stage_timeout_secs == 0 {
            return Err("pipeline timeouts must be > 0".into());
        }
        if p.max_dequeue_count == 0 {
            return Err("pipeline.max_dequeue_count must be > 0".into());
        }
        if p.max_message_bytes < 1024 {
            return Err("pipeline.max_message_bytes must be >= 1024".into());
        }
        // Lookup validation
        if self.lookup.observation_mapping_table.trim().is_empty() {
            return Err("lookup.observation_mapping_table must not be empty".into());
        }
        // Storage validation
        self.storage
            .blob_base_url()
            .map_err(|e| format!("storage.blob_base_url is not a valid URL: {e}"))?;
        Ok(())
    }

    /// Runner tunables derived from the `pipeline` and `lookup` sections.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            poll_interval: Duration::from_millis(p.poll_interval_ms),
            batch_size: p.batch_size,
            visibility_timeout: Duration::from_secs(p.visibility_timeout_secs),
            max_dequeue_count: p.max_dequeue_count,
            max_message_bytes: p.max_message_bytes,
            stage_timeout: Duration::from_secs(p.stage_timeout_secs),
            shorthand_table: self.lookup.shorthand_table.clone(),
            observation_mapping_table: self.lookup.observation_mapping_table.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Messages leased per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    16
}
fn default_visibility_timeout_secs() -> u64 {
    300
}
fn default_max_dequeue_count() -> u32 {
    5
}
fn default_max_message_bytes() -> usize {
    64 * 1024
}
fn default_stage_timeout_secs() -> u64 {
    60
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_dequeue_count: default_max_dequeue_count(),
            max_message_bytes: default_max_message_bytes(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Directory of `<name>.csv` tables. Nothing is loaded when unset.
    #[serde(default)]
    pub tables_dir: Option<PathBuf>,
    #[serde(default = "default_shorthand_table")]
    pub shorthand_table: String,
    #[serde(default = "default_observation_mapping_table")]
    pub observation_mapping_table: String,
}
fn default_shorthand_table() -> String {
    DEFAULT_SHORTHAND_TABLE.into()
}
fn default_observation_mapping_table() -> String {
    DEFAULT_OBSERVATION_MAPPING_TABLE.into()
}
impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            tables_dir: None,
            shorthand_table: default_shorthand_table(),
            observation_mapping_table: default_observation_mapping_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsConfig {
    /// TOML file with `[[senders]]` and `[[receivers]]`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_base_url")]
    pub blob_base_url: String,
}
fn default_blob_base_url() -> String {
    octorouter_db_memory::DEFAULT_BASE_URL.into()
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_base_url: default_blob_base_url(),
        }
    }
}
impl StorageConfig {
    pub fn blob_base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.blob_base_url)
    }
}

pub mod loader {
    use super::{AppConfig, DEFAULT_CONFIG_PATH};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(
                path = %pathbuf.display(),
                "Configuration file not found, using defaults"
            );
        }
        // Environment variable overrides, e.g., OCTOROUTER__PIPELINE__BATCH_SIZE=32
        builder = builder.add_source(
            Environment::with_prefix("OCTOROUTER")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.storage.blob_base_url().unwrap().scheme(), "memory");
    }

    #[test]
    fn test_pipeline_settings_from_config() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.poll_interval_ms = 250;
        cfg.pipeline.stage_timeout_secs = 5;
        cfg.lookup.shorthand_table = "shorthands".into();

        let settings = cfg.pipeline_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.stage_timeout, Duration::from_secs(5));
        assert_eq!(settings.shorthand_table, "shorthands");
        assert_eq!(settings.max_dequeue_count, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));

        let mut cfg = AppConfig::default();
        cfg.pipeline.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pipeline.max_message_bytes = 512;
        assert!(cfg.validate().unwrap_err().contains("max_message_bytes"));

        let mut cfg = AppConfig::default();
        cfg.storage.blob_base_url = "not a url".into();
        assert!(cfg.validate().unwrap_err().contains("blob_base_url"));
    }
}
