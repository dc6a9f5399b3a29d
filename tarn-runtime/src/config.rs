//! Runtime Configuration
//!
//! Configuration for the Tarn host runtime. Values can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TARN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TARN_MAX_CALL_DEPTH` | Nested machine calls before a call-depth error | 65536 |
//! | `TARN_MAX_STEPS` | Instructions per host call (0 = unlimited) | 0 |
//! | `TARN_LOG` | `tracing` filter directive | `warn` |
//!
//! # Example
//!
//! ```rust
//! use tarn_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .max_call_depth(256)
//!     .max_steps(1_000_000)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.machine.max_call_depth, 256);
//! ```

use std::env;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Log level used when `TARN_LOG` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors (default).
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Limits enforced by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Maximum depth of nested calls inside one host call.
    pub max_call_depth: usize,
    /// Maximum instructions executed per host call; 0 disables the limit.
    pub max_steps: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1 << 16,
            max_steps: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Level used when no filter directive is given.
    pub level: LogLevel,
    /// A `tracing` filter directive such as `tarn_runtime=debug`.
    pub filter: Option<String>,
}

impl LogConfig {
    /// The filter directive to install.
    pub fn directive(&self) -> String {
        self.filter
            .clone()
            .unwrap_or_else(|| self.level.as_str().to_string())
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    /// Machine limits.
    pub machine: MachineConfig,
    /// Logging.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from values produced by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = lookup("TARN_MAX_CALL_DEPTH") {
            config.machine.max_call_depth = parse_var("TARN_MAX_CALL_DEPTH", &val)? as usize;
        }

        if let Some(val) = lookup("TARN_MAX_STEPS") {
            config.machine.max_steps = parse_var("TARN_MAX_STEPS", &val)?;
        }

        if let Some(val) = lookup("TARN_LOG") {
            match LogLevel::parse(&val) {
                Some(level) => config.log.level = level,
                None => config.log.filter = Some(val),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.max_call_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "machine.max_call_depth".into(),
                message: "must be at least 1".into(),
            });
        }
        if let Some(filter) = &self.log.filter {
            EnvFilter::try_new(filter).map_err(|e| ConfigError::InvalidValue {
                field: "log.filter".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn parse_var(var: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|e| ConfigError::EnvParse {
        var: var.to_string(),
        message: e.to_string(),
    })
}

/// Install a `tracing` subscriber for the runtime.
///
/// Does nothing if a global subscriber is already set, so tests may call it
/// repeatedly.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directive()).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable {var}: {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum call depth.
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.config.machine.max_call_depth = depth;
        self
    }

    /// Set the per-call instruction limit (0 = unlimited).
    pub fn max_steps(mut self, steps: u64) -> Self {
        self.config.machine.max_steps = steps;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set a `tracing` filter directive.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log.filter = Some(filter.into());
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.machine.max_call_depth, 65536);
        assert_eq!(config.machine.max_steps, 0);
        assert_eq!(config.log.directive(), "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = RuntimeConfig::from_lookup(|var| match var {
            "TARN_MAX_CALL_DEPTH" => Some("64".into()),
            "TARN_MAX_STEPS" => Some("5000".into()),
            "TARN_LOG" => Some("debug".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.machine.max_call_depth, 64);
        assert_eq!(config.machine.max_steps, 5000);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_log_directive_passthrough() {
        let config =
            RuntimeConfig::from_lookup(|var| (var == "TARN_LOG").then(|| "tarn_runtime=trace".into())).unwrap();
        assert_eq!(config.log.directive(), "tarn_runtime=trace");
    }

    #[test]
    fn test_malformed_number_is_error() {
        let err = RuntimeConfig::from_lookup(|var| (var == "TARN_MAX_STEPS").then(|| "lots".into())).unwrap_err();
        assert!(matches!(err, ConfigError::EnvParse { ref var, .. } if var == "TARN_MAX_STEPS"));
    }

    #[test]
    fn test_zero_call_depth_rejected() {
        let err = RuntimeConfig::builder().max_call_depth(0).build().unwrap_err();
        assert!(err.to_string().contains("max_call_depth"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("5"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
    }
}
