//! Configuration loading and representation.
//!
//! Sources, later ones win:
//! 1. built-in defaults
//! 2. an optional TOML file (`rentflow.toml` unless a path is given)
//! 3. `RENTFLOW__SECTION__KEY` environment variables, e.g.
//!    `RENTFLOW__ENGINE__GRACE_PERIOD_DAYS=1`

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use rentflow_observability::LogConfig;
use rentflow_rental::ChargePolicy;

pub const DEFAULT_CONFIG_FILE: &str = "rentflow.toml";
pub const ENV_PREFIX: &str = "RENTFLOW";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Late rate (minor units per unit per day) used when a booking omits one.
    pub default_daily_late_rate: i64,
    /// Days after `rental_end` before late fees accrue.
    pub grace_period_days: u32,
    /// Allow activating a line before its rental start date.
    pub allow_early_activation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_daily_late_rate: 0,
            grace_period_days: 0,
            allow_early_activation: true,
        }
    }
}

impl EngineConfig {
    pub fn charge_policy(&self) -> ChargePolicy {
        ChargePolicy {
            grace_period_days: self.grace_period_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub log: LogConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from `rentflow.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document on top of the defaults (no environment).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = AppConfig::load_from(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(cfg.engine.grace_period_days, EngineConfig::default().grace_period_days);
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [engine]
            default_daily_late_rate = 25
            grace_period_days = 1
            allow_early_activation = false

            [log]
            json = false
            "#,
        )
        .unwrap();

        assert_eq!(cfg.engine.default_daily_late_rate, 25);
        assert_eq!(cfg.engine.charge_policy().grace_period_days, 1);
        assert!(!cfg.engine.allow_early_activation);
        assert!(!cfg.log.json);
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.server, ServerConfig::default());
    }
}
