//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides. The value
//! is built once at startup and handed to every component that needs it.

use crate::storage::Tier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub privacy: PrivacyConfig,

    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Repository location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("privagg").join("privagg.db").to_string_lossy().to_string())
        .unwrap_or_else(|| "./privagg_data/privagg.db".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Anonymization policy applied to SUM/AVG results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationMode {
    #[default]
    DifferentialPrivacy,
    KAnonymity,
    GaussianNoise,
}

impl std::str::FromStr for AnonymizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "differential_privacy" => Ok(Self::DifferentialPrivacy),
            "k_anonymity" => Ok(Self::KAnonymity),
            "gaussian_noise" => Ok(Self::GaussianNoise),
            other => Err(format!("unknown privacy mode: {}", other)),
        }
    }
}

/// Parameters of one privacy tier
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TierParams {
    /// Group size for k-anonymity
    pub k_anonymity: usize,
    /// Gaussian standard deviation relative to the reference value
    pub noise_factor: f64,
    /// Differential-privacy epsilon
    pub epsilon: f64,
}

/// Privacy parameters per tier
#[derive(Debug, Clone, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub mode: AnonymizationMode,

    #[serde(default = "default_tier1")]
    pub tier1: TierParams,

    #[serde(default = "default_tier2")]
    pub tier2: TierParams,

    #[serde(default = "default_tier3")]
    pub tier3: TierParams,
}

fn default_tier1() -> TierParams {
    TierParams {
        k_anonymity: 1,
        noise_factor: 0.01,
        epsilon: 10.0,
    }
}

fn default_tier2() -> TierParams {
    TierParams {
        k_anonymity: 2,
        noise_factor: 0.05,
        epsilon: 5.0,
    }
}

fn default_tier3() -> TierParams {
    TierParams {
        k_anonymity: 3,
        noise_factor: 0.1,
        epsilon: 1.0,
    }
}

impl PrivacyConfig {
    pub fn tier(&self, tier: Tier) -> &TierParams {
        match tier {
            Tier::One => &self.tier1,
            Tier::Two => &self.tier2,
            Tier::Three => &self.tier3,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mode: AnonymizationMode::default(),
            tier1: default_tier1(),
            tier2: default_tier2(),
            tier3: default_tier3(),
        }
    }
}

/// Interpolation thresholds of the time unification
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessingConfig {
    /// Highest tolerated fraction of missing grid points
    #[serde(default = "default_interpolation_limit")]
    pub interpolation_limit: f64,

    /// Longest gap that may be interpolated
    #[serde(default = "default_max_interpolation_span")]
    pub max_interpolation_span_ms: i64,
}

fn default_interpolation_limit() -> f64 {
    0.21
}

fn default_max_interpolation_span() -> i64 {
    2 * 60 * 60 * 1000 // 2 hours
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            interpolation_limit: default_interpolation_limit(),
            max_interpolation_span_ms: default_max_interpolation_span(),
        }
    }
}

/// Sweep cadence and processing limits
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    /// Log the full failure chain of aborted queries
    #[serde(default)]
    pub diagnostic_mode: bool,
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_max_concurrent_queries() -> usize {
    4
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_concurrent_queries: default_max_concurrent_queries(),
            diagnostic_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    None,
    Dummy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub method: PaymentMethod,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("privagg").join("config.toml")),
            Some(PathBuf::from("/etc/privagg/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check value ranges the pipeline relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in Tier::ALL {
            let params = self.privacy.tier(tier);
            if params.k_anonymity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "privacy.tier{}.k_anonymity must be at least 1",
                    tier
                )));
            }
            if !(params.epsilon.is_finite() && params.epsilon > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "privacy.tier{}.epsilon must be positive",
                    tier
                )));
            }
            if !(params.noise_factor.is_finite() && params.noise_factor >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "privacy.tier{}.noise_factor must not be negative",
                    tier
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.preprocessing.interpolation_limit) {
            return Err(ConfigError::Invalid(
                "preprocessing.interpolation_limit must be within [0, 1]".to_string(),
            ));
        }
        if self.preprocessing.max_interpolation_span_ms < 0 {
            return Err(ConfigError::Invalid(
                "preprocessing.max_interpolation_span_ms must not be negative".to_string(),
            ));
        }
        if self.lifecycle.max_concurrent_queries == 0 || self.lifecycle.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.sweep_interval_secs and max_concurrent_queries must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PRIVAGG_DATABASE") {
            self.storage.database_path = path;
        }

        if let Ok(mode) = std::env::var("PRIVAGG_PRIVACY_MODE") {
            match mode.parse() {
                Ok(m) => self.privacy.mode = m,
                Err(e) => tracing::warn!("Ignoring PRIVAGG_PRIVACY_MODE: {}", e),
            }
        }

        if let Ok(secs) = std::env::var("PRIVAGG_SWEEP_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                self.lifecycle.sweep_interval_secs = s;
            }
        }
        if let Ok(flag) = std::env::var("PRIVAGG_DIAGNOSTIC_MODE") {
            if let Ok(f) = flag.parse() {
                self.lifecycle.diagnostic_mode = f;
            }
        }

        if let Ok(level) = std::env::var("PRIVAGG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("PRIVAGG_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Privagg Configuration
#
# Environment variables override these settings:
# - PRIVAGG_DATABASE
# - PRIVAGG_PRIVACY_MODE
# - PRIVAGG_SWEEP_INTERVAL_SECS
# - PRIVAGG_DIAGNOSTIC_MODE
# - PRIVAGG_LOG_LEVEL
# - PRIVAGG_LOG_FORMAT

[storage]
# SQLite database file
database_path = "~/.local/share/privagg/privagg.db"

[privacy]
# differential_privacy, k_anonymity or gaussian_noise
mode = "differential_privacy"

# Per-tier parameters. Tier 3 is the strictest.
[privacy.tier1]
k_anonymity = 1
noise_factor = 0.01
epsilon = 10.0

[privacy.tier2]
k_anonymity = 2
noise_factor = 0.05
epsilon = 5.0

[privacy.tier3]
k_anonymity = 3
noise_factor = 0.1
epsilon = 1.0

[preprocessing]
# Rows with a larger fraction of missing points are discarded
interpolation_limit = 0.21

# Longest gap that is interpolated (ms)
max_interpolation_span_ms = 7200000

[lifecycle]
# How often due queries are activated (seconds)
sweep_interval_secs = 5

# Queries processed in parallel
max_concurrent_queries = 4

# Log full failure details of aborted queries
diagnostic_mode = false

[payment]
# none or dummy
method = "none"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/privagg/privagg.log"
"#
    .to_string()
}
