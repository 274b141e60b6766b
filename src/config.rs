//! Configuration loading.
//!
//! Settings are layered the way `original_source`'s `pydantic_settings`
//! `ServiceConfig` does: every field has a sane default, every field can be
//! overridden by an environment variable prefixed `DG_`, and the CLI
//! (`clap`, with `env` support) is the single entry point that resolves
//! both.

use clap::Parser;

fn default_difficulty() -> u32 {
    22
}

#[derive(Parser, Debug, Clone)]
#[command(name = "dedi-gatewayd", about = "Decentralised discovery gateway")]
pub struct Config {
    /// Publicly reachable base URL other nodes use to reach this instance.
    #[arg(long, env = "DG_ACCESS_URL", default_value = "http://localhost:5321")]
    pub access_url: String,

    /// Human-readable name advertised to peers.
    #[arg(long, env = "DG_SERVICE_NAME", default_value = "dedi-gateway")]
    pub service_name: String,

    /// Human-readable description advertised to peers.
    #[arg(long, env = "DG_SERVICE_DESCRIPTION", default_value = "")]
    pub service_description: String,

    /// Local HTTP listen port.
    #[arg(long, env = "DG_PORT", default_value_t = 5321)]
    pub port: u16,

    /// Exponential Moving Average factor applied to node score updates.
    #[arg(long, env = "DG_EMA_FACTOR", default_value_t = 0.3)]
    pub ema_factor: f64,

    /// Leading-zero-bit difficulty demanded of admission proof-of-work.
    #[arg(long, env = "DG_CHALLENGE_DIFFICULTY", default_value_t = default_difficulty())]
    pub challenge_difficulty: u32,

    /// `memory` or `document`.
    #[arg(long, env = "DG_DATABASE_DRIVER", default_value = "memory")]
    pub database_driver: String,
    #[arg(long, env = "DG_DATABASE_HOST", default_value = "localhost")]
    pub database_host: String,
    #[arg(long, env = "DG_DATABASE_PORT", default_value_t = 27017)]
    pub database_port: u16,
    #[arg(long, env = "DG_DATABASE_NAME", default_value = "dedi-gateway")]
    pub database_name: String,

    /// `memory` or `redis`.
    #[arg(long, env = "DG_CACHE_DRIVER", default_value = "memory")]
    pub cache_driver: String,
    #[arg(long, env = "DG_CACHE_HOST", default_value = "localhost")]
    pub cache_host: String,
    #[arg(long, env = "DG_CACHE_PORT", default_value_t = 6379)]
    pub cache_port: u16,

    /// `memory` or `vault`.
    #[arg(long, env = "DG_KMS_DRIVER", default_value = "memory")]
    pub kms_driver: String,
    #[arg(long, env = "DG_VAULT_URL")]
    pub vault_url: Option<String>,
    #[arg(long, env = "DG_VAULT_ROLE_ID")]
    pub vault_role_id: Option<String>,
    #[arg(long, env = "DG_VAULT_SECRET_ID")]
    pub vault_secret_id: Option<String>,

    /// `error`, `warn`, `info`, `debug`, or `trace`.
    #[arg(long, env = "DG_LOGGING_LEVEL", default_value = "info")]
    pub logging_level: String,

    /// Directory used by the memory driver for optional disk snapshots.
    #[arg(long, env = "DG_HOME", default_value = ".dedi-gateway")]
    pub home: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unsupported {driver_kind} driver: {driver}")]
    UnsupportedDriver {
        driver_kind: &'static str,
        driver: String,
    },
}

impl Config {
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// Only the `memory` database/cache driver and the `memory`/`vault` KMS
    /// drivers are wired up; anything else is a configuration error caught
    /// at startup rather than at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_driver != "memory" {
            return Err(ConfigError::UnsupportedDriver {
                driver_kind: "database",
                driver: self.database_driver.clone(),
            });
        }
        if self.cache_driver != "memory" {
            return Err(ConfigError::UnsupportedDriver {
                driver_kind: "cache",
                driver: self.cache_driver.clone(),
            });
        }
        if self.kms_driver != "memory" && self.kms_driver != "vault" {
            return Err(ConfigError::UnsupportedDriver {
                driver_kind: "kms",
                driver: self.kms_driver.clone(),
            });
        }
        Ok(())
    }
}
