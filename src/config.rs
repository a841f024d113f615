//! Configuration loading for the pulse control core.
//!
//! Configuration is loaded from:
//! 1. `config/pulse.toml` (base configuration)
//! 2. Environment variables (prefixed with `PULSECTL_`)
//!
//! # Environment Variable Overrides
//!
//! A double underscore separates the section from the key, so field
//! names that themselves contain underscores survive the mapping:
//!
//! ```text
//! PULSECTL_APPLICATION__LOG_LEVEL=debug
//! PULSECTL_BOARD__CORE_CLOCK_MHZ=400.0
//! PULSECTL_DRIVER__EXECUTABLE=/opt/spincore/pulseblaster
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration sources could not be read or merged.
    #[error("configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The configuration parsed but contains invalid values.
    #[error("configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Board connection settings.
    #[serde(default)]
    pub board: BoardConfig,
    /// Driver executable settings.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Status poller settings.
    #[serde(default)]
    pub poller: PollerConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Connection configuration for one board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board index as enumerated by the driver.
    #[serde(default)]
    pub board: u32,
    /// Core clock frequency in MHz.
    #[serde(default = "default_core_clock_mhz")]
    pub core_clock_mhz: f64,
    /// Enable driver-side debug logging.
    #[serde(default)]
    pub debug: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            board: 0,
            core_clock_mhz: default_core_clock_mhz(),
            debug: false,
        }
    }
}

/// Driver subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Path to the driver executable.
    #[serde(default = "default_driver_executable")]
    pub executable: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            executable: default_driver_executable(),
        }
    }
}

/// Status poller timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Period between status samples.
    #[serde(with = "humantime_serde", default = "default_poll_period")]
    pub period: Duration,
    /// Poll interval used by `wait_until_stopped`.
    #[serde(with = "humantime_serde", default = "default_wait_poll_interval")]
    pub wait_poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            period: default_poll_period(),
            wait_poll_interval: default_wait_poll_interval(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "pulse_ctrl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_core_clock_mhz() -> f64 {
    500.0
}

fn default_driver_executable() -> PathBuf {
    PathBuf::from("bin/pulseblaster")
}

fn default_poll_period() -> Duration {
    Duration::from_secs(1)
}

fn default_wait_poll_interval() -> Duration {
    Duration::from_millis(100)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/pulse.toml` and the environment.
    ///
    /// Environment variables (`PULSECTL_` prefix) take precedence over the
    /// file. Loaded configuration is validated before being returned.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/pulse.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PULSECTL_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !self.board.core_clock_mhz.is_finite() || self.board.core_clock_mhz <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid core_clock_mhz {}. Must be a positive frequency",
                self.board.core_clock_mhz
            )));
        }

        if self.poller.period.is_zero() {
            return Err(ConfigError::ValidationError(
                "Poller period must be non-zero".to_string(),
            ));
        }

        if self.poller.wait_poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "wait_poll_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.board.core_clock_mhz, 500.0);
        assert_eq!(settings.board.board, 0);
        assert!(!settings.board.debug);
        assert_eq!(settings.poller.period, Duration::from_secs(1));
        assert_eq!(settings.poller.wait_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_core_clock() {
        let mut settings = Settings::default();
        settings.board.core_clock_mhz = 0.0;
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid core_clock_mhz"));
    }

    #[test]
    fn test_zero_poll_period() {
        let mut settings = Settings::default();
        settings.poller.period = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_overrides_multi_word_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        std::fs::write(&path, "").unwrap();

        // Values deliberately match test_load_from_toml's file values so a
        // concurrently running load test cannot observe a conflict.
        std::env::set_var("PULSECTL_BOARD__CORE_CLOCK_MHZ", "400.0");
        std::env::set_var("PULSECTL_APPLICATION__LOG_LEVEL", "debug");
        let settings = Settings::load_from(&path);
        std::env::remove_var("PULSECTL_BOARD__CORE_CLOCK_MHZ");
        std::env::remove_var("PULSECTL_APPLICATION__LOG_LEVEL");

        let settings = settings.unwrap();
        assert_eq!(settings.board.core_clock_mhz, 400.0);
        assert_eq!(settings.application.log_level, "debug");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        std::fs::write(
            &path,
            r#"
[application]
log_level = "debug"

[board]
board = 1
core_clock_mhz = 400.0
debug = true

[poller]
period = "250ms"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.board.board, 1);
        assert_eq!(settings.board.core_clock_mhz, 400.0);
        assert!(settings.board.debug);
        assert_eq!(settings.poller.period, Duration::from_millis(250));
        // Unspecified sections fall back to defaults.
        assert_eq!(settings.poller.wait_poll_interval, Duration::from_millis(100));
    }
}
