//! Runtime configuration for the `forrst` binary.
//!
//! Layers, later wins: built-in defaults, `forrst.toml`, `FORRST_*`
//! environment variables, command-line flags.

use std::path::{Path, PathBuf};

use engine::HandlerConfig;
use serde::Deserialize;
use thiserror::Error;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "forrst.toml";

pub const ENV_DEBUG: &str = "FORRST_DEBUG";
pub const ENV_LOG_LEVEL: &str = "FORRST_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "FORRST_LOG_FORMAT";
pub const ENV_OTLP_ENDPOINT: &str = "FORRST_OTLP_ENDPOINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {name}: expected {expected}")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(name: &'static str, value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidValue {
                name,
                value: value.to_owned(),
                expected: "`text` or `json`",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `engine=debug,warn`. `RUST_LOG`
    /// takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    /// OTLP (gRPC) collector endpoint. Span export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub handler: HandlerConfig,
    pub logging: LoggingConfig,
}

/// Command-line overrides. `None`/`false` leaves the configured value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub json_logs: bool,
    pub debug: bool,
}

impl Config {
    /// Loads the configuration file.
    ///
    /// An explicitly named file must exist. When no path is given,
    /// [`DEFAULT_CONFIG_FILE`] is used if present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::parse(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Applies `FORRST_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_DEBUG) {
            self.handler.debug = parse_bool(ENV_DEBUG, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            self.logging.level = value;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = LogFormat::parse(ENV_LOG_FORMAT, &value)?;
        }
        if let Some(value) = lookup(ENV_OTLP_ENDPOINT) {
            self.logging.otlp_endpoint = Some(value).filter(|v| !v.trim().is_empty());
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
        if overrides.json_logs {
            self.logging.format = LogFormat::Json;
        }
        if overrides.debug {
            self.handler.debug = true;
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
            expected: "a boolean",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.logging.level, "info");
        assert!(!config.handler.debug);
    }

    #[test]
    fn file_sections_are_read() {
        let config = Config::parse(
            r#"
            [handler]
            debug = true
            expose_extension_warnings = true

            [logging]
            level = "engine=debug,info"
            format = "json"
            otlp_endpoint = "http://localhost:4317"
            "#,
        )
        .unwrap();

        assert!(config.handler.debug);
        assert!(config.handler.expose_extension_warnings);
        assert_eq!(config.logging.level, "engine=debug,info");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.otlp_endpoint.as_deref(), Some("http://localhost:4317"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[logging]\nlevl = \"debug\"").is_err());
        assert!(Config::parse("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn named_file_must_exist() {
        let missing = std::env::temp_dir().join("forrst-config-that-does-not-exist.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut config = Config::parse("[logging]\nlevel = \"warn\"").unwrap();
        config
            .apply_env(env(&[
                (ENV_DEBUG, "true"),
                (ENV_LOG_LEVEL, "debug"),
                (ENV_LOG_FORMAT, "JSON"),
                (ENV_OTLP_ENDPOINT, "http://collector:4317"),
            ]))
            .unwrap();

        assert!(config.handler.debug);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn malformed_environment_values_are_errors() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[(ENV_DEBUG, "maybe")])).unwrap_err();
        assert!(err.to_string().contains(ENV_DEBUG));

        let err = config.apply_env(env(&[(ENV_LOG_FORMAT, "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_LOG_FORMAT, .. }));
    }

    #[test]
    fn flags_win_over_everything() {
        let mut config = Config::default();
        config.apply_env(env(&[(ENV_LOG_LEVEL, "warn")])).unwrap();
        config.apply_overrides(&Overrides {
            log_level: Some("trace".into()),
            json_logs: true,
            debug: true,
        });

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.handler.debug);
    }

    #[test]
    fn unset_flags_keep_configured_values() {
        let mut config = Config::parse("[handler]\ndebug = true").unwrap();
        config.apply_overrides(&Overrides::default());
        assert!(config.handler.debug);
        assert_eq!(config.logging.format, LogFormat::Text);
    }
}
