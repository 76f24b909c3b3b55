use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::DispatchConfig;

/// Engine configuration, resolved from defaults, an optional TOML file,
/// `APPROVD_*` environment variables, and programmatic overrides — in
/// that order.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    /// HMAC key for audit entry signatures.
    pub signing_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            audit: AuditConfig { signing_key: String::new().into() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub signing_key: Option<String>,
    pub log_level: Option<String>,
    pub dispatch_max_attempts: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    dispatch: Option<DispatchPatch>,
    audit: Option<AuditPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    max_attempts: Option<u32>,
    base_delay_secs: Option<i64>,
    backoff_multiplier: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl EngineConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("approvd.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(dispatch) = patch.dispatch {
            if let Some(max_attempts) = dispatch.max_attempts {
                self.dispatch.max_attempts = max_attempts;
            }
            if let Some(base_delay_secs) = dispatch.base_delay_secs {
                self.dispatch.base_delay_secs = base_delay_secs;
            }
            if let Some(backoff_multiplier) = dispatch.backoff_multiplier {
                self.dispatch.backoff_multiplier = backoff_multiplier;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(signing_key_value) = audit.signing_key {
                self.audit.signing_key = signing_key_value.into();
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("APPROVD_DISPATCH_MAX_ATTEMPTS") {
            self.dispatch.max_attempts = parse_u32("APPROVD_DISPATCH_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("APPROVD_DISPATCH_BASE_DELAY_SECS") {
            self.dispatch.base_delay_secs = value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "APPROVD_DISPATCH_BASE_DELAY_SECS".to_string(),
                    value,
                }
            })?;
        }
        if let Some(value) = read_env("APPROVD_AUDIT_SIGNING_KEY") {
            self.audit.signing_key = value.into();
        }
        if let Some(value) = read_env("APPROVD_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("APPROVD_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(signing_key) = overrides.signing_key {
            self.audit.signing_key = signing_key.into();
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(max_attempts) = overrides.dispatch_max_attempts {
            self.dispatch.max_attempts = max_attempts;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.base_delay_secs < 0 {
            return Err(ConfigError::Validation(
                "dispatch.base_delay_secs must not be negative".to_string(),
            ));
        }
        if self.audit.signing_key.expose_secret().is_empty() {
            return Err(ConfigError::Validation(
                "audit.signing_key must be configured".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("approvd.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}
