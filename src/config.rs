use crate::services::protection::types::CaptureMode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the stream captured once per session at bind time.
pub const DEFAULT_STARTUP_STREAM: &str = "startup";
/// Name of the stream used for explicit, user-requested captures.
pub const MANUAL_STREAM: &str = "manual";
/// Stream holding the damaged log state preserved right before a restore.
pub const BEFORE_RECOVERY_STREAM: &str = "before-recovery";
/// Stream used by the `emergency` maintenance command.
pub const EMERGENCY_STREAM: &str = "emergency";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Log protection settings
    #[serde(default)]
    pub protection: ProtectionConfig,

    /// Maintenance settings
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Settings for the integrity monitor and the incremental backup streams
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProtectionConfig {
    /// Interval between integrity polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A shrink below `previous_size * truncation_ratio` counts as truncation
    #[serde(default = "default_truncation_ratio")]
    pub truncation_ratio: f64,

    /// Truncation is only reported once the log was larger than this many bytes
    #[serde(default = "default_truncation_min_size")]
    pub truncation_min_size: u64,

    /// Streams captured after every verified append
    #[serde(default = "default_write_streams")]
    pub write_streams: Vec<String>,

    /// Stream captured once when a project is bound
    #[serde(default = "default_startup_stream")]
    pub startup_stream: String,

    /// Streams whose segments live in the secondary directory instead of the project
    #[serde(default = "default_external_streams")]
    pub external_streams: Vec<String>,

    /// Directory outside every project holding the external streams
    #[serde(default)]
    pub secondary_dir: Option<PathBuf>,
}

/// Settings for the backup maintenance utilities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MaintenanceConfig {
    /// Legacy full snapshots older than this many days are offered for cleanup
    #[serde(default = "default_legacy_cleanup_days")]
    pub legacy_cleanup_days: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_truncation_ratio() -> f64 {
    0.1
}

fn default_truncation_min_size() -> u64 {
    1000
}

fn default_write_streams() -> Vec<String> {
    vec!["primary".to_string(), "secondary".to_string()]
}

fn default_startup_stream() -> String {
    DEFAULT_STARTUP_STREAM.to_string()
}

fn default_external_streams() -> Vec<String> {
    vec!["secondary".to_string()]
}

fn default_legacy_cleanup_days() -> u64 {
    7
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            truncation_ratio: default_truncation_ratio(),
            truncation_min_size: default_truncation_min_size(),
            write_streams: default_write_streams(),
            startup_stream: default_startup_stream(),
            external_streams: default_external_streams(),
            secondary_dir: None,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            legacy_cleanup_days: default_legacy_cleanup_days(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protection: ProtectionConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl ProtectionConfig {
    /// Streams that may supply a restore candidate, in preference order for ties.
    pub fn candidate_streams(&self) -> Vec<String> {
        let mut streams = self.write_streams.clone();
        for extra in [self.startup_stream.as_str(), MANUAL_STREAM] {
            if !streams.iter().any(|s| s == extra) {
                streams.push(extra.to_string());
            }
        }
        streams
    }

    /// Whether a stream's segments are kept outside the project directory
    pub fn is_external(&self, stream: &str) -> bool {
        self.external_streams.iter().any(|s| s == stream)
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let protection = &self.protection;

        if protection.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if !(protection.truncation_ratio > 0.0 && protection.truncation_ratio < 1.0) {
            return Err(ConfigError::ValidationError(
                "truncation_ratio must be between 0 and 1 (exclusive)".to_string(),
            ));
        }

        if protection.write_streams.is_empty() {
            return Err(ConfigError::ValidationError(
                "write_streams cannot be empty".to_string(),
            ));
        }

        let reserved = [BEFORE_RECOVERY_STREAM, EMERGENCY_STREAM];
        for stream in protection
            .write_streams
            .iter()
            .chain(std::iter::once(&protection.startup_stream))
            .chain(protection.external_streams.iter())
        {
            if !is_valid_stream_name(stream) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid stream name '{stream}' (use letters, digits, '-' or '_')"
                )));
            }
            if reserved.contains(&stream.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "stream name '{stream}' is reserved"
                )));
            }
        }

        Ok(())
    }
}

/// Stream names end up in file names, so only a safe subset is accepted.
///
/// A name ending in `-<digits>-<mode tag>` is rejected: its latest-copy file
/// would carry the name of another stream's segment.
pub fn is_valid_stream_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !has_segment_suffix(name)
}

fn has_segment_suffix(name: &str) -> bool {
    let mut parts = name.rsplitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(tag), Some(seq), Some(_)) => {
            CaptureMode::from_file_tag(tag).is_some()
                && !seq.is_empty()
                && seq.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {msg}"),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {msg}"),
            ConfigError::SerializeError(msg) => write!(f, "Serialize error: {msg}"),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
