//! Application configuration.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::errors::ConfigError;
use crate::infrastructure::executors::PanicPolicy;
use crate::infrastructure::image::memory_cache::{
    DEFAULT_MEMORY_FRACTION, MAX_MEMORY_FRACTION, MIN_MEMORY_FRACTION, detect_memory_baseline,
};
use crate::infrastructure::image::storage_cache::{DEFAULT_MAX_STORAGE_SIZE, StorageFormat};

use super::args::CliArgs;

pub(crate) const APP_NAME: &str = "wheels";
pub(crate) const APP_QUALIFIER: &str = "com";
pub(crate) const APP_ORGANIZATION: &str = "linuxmobile";

const DEFAULT_FADE_DURATION_MS: u64 = 200;

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache budgets and storage location.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub pools: PoolConfig,

    /// How loaded images appear on targets.
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Share of `memory_baseline_bytes` given to the memory cache.
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f32,

    /// Memory the fraction applies to. Measured from the system when unset.
    #[serde(default)]
    pub memory_baseline_bytes: Option<u64>,

    /// Persist images to disk.
    #[serde(default = "default_true")]
    pub storage_enabled: bool,

    /// Storage directory. Defaults to the platform cache dir.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Storage budget in bytes.
    #[serde(default = "default_storage_max_bytes")]
    pub storage_max_bytes: u64,

    /// Encoding for stored entries.
    #[serde(default)]
    pub storage_format: StorageFormat,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            memory_baseline_bytes: None,
            storage_enabled: true,
            storage_dir: None,
            storage_max_bytes: DEFAULT_MAX_STORAGE_SIZE,
            storage_format: StorageFormat::default(),
        }
    }
}

impl CacheConfig {
    /// Checks budgets before any cache is built.
    ///
    /// # Errors
    /// Returns `InvalidFraction` for a memory fraction outside 0.1..=0.8 and
    /// `ZeroBudget` for a zero memory baseline or storage budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_fraction(
            "memory",
            self.memory_fraction,
            MIN_MEMORY_FRACTION,
            MAX_MEMORY_FRACTION,
        )?;
        if self.memory_baseline_bytes == Some(0) {
            return Err(ConfigError::ZeroBudget {
                name: "memory baseline",
            });
        }
        if self.storage_enabled && self.storage_max_bytes == 0 {
            return Err(ConfigError::ZeroBudget { name: "storage" });
        }
        Ok(())
    }

    /// Returns the configured memory baseline, or measures it.
    #[must_use]
    pub fn effective_memory_baseline(&self) -> u64 {
        self.memory_baseline_bytes
            .unwrap_or_else(detect_memory_baseline)
    }

    /// Returns the default storage directory.
    #[must_use]
    pub fn default_storage_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().join("images"))
    }

    /// Returns effective storage directory.
    #[must_use]
    pub fn effective_storage_dir(&self) -> Option<PathBuf> {
        self.storage_dir.clone().or_else(Self::default_storage_dir)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Override for the HTTP pool size.
    #[serde(default)]
    pub http_size: Option<usize>,

    /// Override for the image pool size.
    #[serde(default)]
    pub image_size: Option<usize>,

    /// What happens when a pool task panics.
    #[serde(default)]
    pub panic_policy: PanicPolicy,
}

/// Display configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Cross-fade newly loaded images over the previous content.
    #[serde(default = "default_true")]
    pub fade_in: bool,

    /// Cross-fade length in milliseconds.
    #[serde(default = "default_fade_duration_ms")]
    pub fade_duration_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            fade_in: true,
            fade_duration_ms: DEFAULT_FADE_DURATION_MS,
        }
    }
}

impl DisplayConfig {
    /// Returns the fade length, or `None` when fading is off.
    #[must_use]
    pub const fn fade(&self) -> Option<Duration> {
        if self.fade_in && self.fade_duration_ms > 0 {
            Some(Duration::from_millis(self.fade_duration_ms))
        } else {
            None
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_memory_fraction() -> f32 {
    DEFAULT_MEMORY_FRACTION
}

const fn default_storage_max_bytes() -> u64 {
    DEFAULT_MAX_STORAGE_SIZE
}

const fn default_fade_duration_ms() -> u64 {
    DEFAULT_FADE_DURATION_MS
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.storage_dir = Some(cache_dir.clone());
        }
        if let Some(fraction) = args.memory_fraction {
            self.cache.memory_fraction = fraction;
        }
        if let Some(max_bytes) = args.storage_max_bytes {
            self.cache.storage_max_bytes = max_bytes;
        }
        if args.no_storage {
            self.cache.storage_enabled = false;
        }
        if args.no_fade {
            self.display.fade_in = false;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("wheels.log"))
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use test_case::test_case;

    #[test]
    fn test_parse_config_sections() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            memory_fraction = 0.5
            storage_max_bytes = 1048576
            storage_format = { kind = "jpeg", quality = 80 }

            [pools]
            image_size = 3
            panic_policy = "rethrow_on_main"

            [display]
            fade_in = false
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert!((config.cache.memory_fraction - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.cache.memory_baseline_bytes, None);
        assert!(config.cache.effective_memory_baseline() > 0);
        assert_eq!(config.cache.storage_max_bytes, 1_048_576);
        assert_eq!(
            config.cache.storage_format,
            StorageFormat::Jpeg { quality: 80 }
        );
        assert_eq!(config.pools.image_size, Some(3));
        assert_eq!(config.pools.http_size, None);
        assert_eq!(config.pools.panic_policy, PanicPolicy::RethrowOnMain);
        assert_eq!(config.display.fade(), None);
        assert_eq!(config.display.fade_duration_ms, DEFAULT_FADE_DURATION_MS);
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.cache.storage_enabled);
        assert!(config.cache.validate().is_ok());
        assert_eq!(config.pools.panic_policy, PanicPolicy::Log);
        assert_eq!(config.display.fade(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").expect("Failed to parse config");
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.display, DisplayConfig::default());
    }

    #[test_case(0.1, true ; "lower bound")]
    #[test_case(0.8, true ; "upper bound")]
    #[test_case(0.05, false ; "below range")]
    #[test_case(0.9, false ; "above range")]
    #[test_case(f32::NAN, false ; "not a number")]
    fn test_validate_memory_fraction(fraction: f32, valid: bool) {
        let config = CacheConfig {
            memory_fraction: fraction,
            ..CacheConfig::default()
        };
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_validate_zero_storage_budget() {
        let mut config = CacheConfig {
            storage_max_bytes: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroBudget { name: "storage" })
        ));

        config.storage_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_baseline_override() {
        let config: AppConfig =
            toml::from_str("[cache]\nmemory_baseline_bytes = 1000\n").expect("Failed to parse");
        assert_eq!(config.cache.memory_baseline_bytes, Some(1000));
        assert_eq!(config.cache.effective_memory_baseline(), 1000);

        let zero = CacheConfig {
            memory_baseline_bytes: Some(0),
            ..CacheConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::ZeroBudget {
                name: "memory baseline"
            })
        ));
    }

    #[test]
    fn test_merge_with_args() {
        let args = CliArgs::parse_from([
            "wheels",
            "--log-level",
            "trace",
            "--cache-dir",
            "/tmp/wheels",
            "--memory-fraction",
            "0.4",
            "--no-storage",
            "--no-fade",
            "a.png",
        ]);
        let mut config = AppConfig::default();
        config.merge_with_args(&args);

        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(
            config.cache.effective_storage_dir(),
            Some(PathBuf::from("/tmp/wheels"))
        );
        assert!((config.cache.memory_fraction - 0.4).abs() < f32::EPSILON);
        assert!(!config.cache.storage_enabled);
        assert!(!config.display.fade_in);
        assert_eq!(args.files, vec![PathBuf::from("a.png")]);
    }
}
