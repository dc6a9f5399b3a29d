//! Compiler options.
//!
//! Options are plain data with builder-style setters. [`CompileOptions::from_env`]
//! overlays `TARN_*` environment variables on the defaults:
//!
//! | Variable                | Option             | Default |
//! |-------------------------|--------------------|---------|
//! | `TARN_DIRECT_DISPATCH`  | `direct_dispatch`  | `true`  |
//! | `TARN_EMBED_PROTOCOL`   | `embed_protocol`   | `true`  |
//! | `TARN_HOST_ARG_WORDS`   | `host_arg_words`   | `32`    |

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, found `{value}`")]
    InvalidBool { var: &'static str, value: String },
    #[error("{var}: expected a number between {min} and {max}, found `{value}`")]
    InvalidNumber {
        var: &'static str,
        value: String,
        min: u64,
        max: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Perform sites inside a handled body that install exactly the performed
    /// effect skip the frame walk.
    pub direct_dispatch: bool,
    /// Embed the protocol table as a custom section.
    pub embed_protocol: bool,
    /// Capacity of the argument scratch area, in 64-bit words. Operations
    /// reaching the host may not take more arguments than this.
    pub host_arg_words: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            direct_dispatch: true,
            embed_protocol: true,
            host_arg_words: 32,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_direct_dispatch(mut self, on: bool) -> Self {
        self.direct_dispatch = on;
        self
    }

    pub fn with_embed_protocol(mut self, on: bool) -> Self {
        self.embed_protocol = on;
        self
    }

    pub fn with_host_arg_words(mut self, words: u32) -> Self {
        self.host_arg_words = words;
        self
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(v) = lookup("TARN_DIRECT_DISPATCH") {
            options.direct_dispatch = parse_bool("TARN_DIRECT_DISPATCH", &v)?;
        }
        if let Some(v) = lookup("TARN_EMBED_PROTOCOL") {
            options.embed_protocol = parse_bool("TARN_EMBED_PROTOCOL", &v)?;
        }
        if let Some(v) = lookup("TARN_HOST_ARG_WORDS") {
            options.host_arg_words = parse_number("TARN_HOST_ARG_WORDS", &v, 1, 1024)? as u32;
        }
        Ok(options)
    }
}

pub fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

pub fn parse_number(var: &'static str, value: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| (min..=max).contains(n))
        .ok_or_else(|| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
            min,
            max,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_overrides_defaults() {
        let options = CompileOptions::from_lookup(|var| match var {
            "TARN_DIRECT_DISPATCH" => Some("off".into()),
            "TARN_HOST_ARG_WORDS" => Some("8".into()),
            _ => None,
        })
        .unwrap();
        assert!(!options.direct_dispatch);
        assert!(options.embed_protocol);
        assert_eq!(options.host_arg_words, 8);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = CompileOptions::from_lookup(|var| (var == "TARN_EMBED_PROTOCOL").then(|| "maybe".into())).unwrap_err();
        assert!(err.to_string().contains("TARN_EMBED_PROTOCOL"));
        let err = CompileOptions::from_lookup(|var| (var == "TARN_HOST_ARG_WORDS").then(|| "0".into())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { min: 1, .. }));
    }
}
