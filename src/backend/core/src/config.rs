//! Configuration management.
//!
//! Every section has defaults, so an empty environment yields a working
//! local setup. Environment variables use the `PANQUEUE` prefix with `__`
//! as the section separator, e.g. `PANQUEUE__REDIS__URL`,
//! `PANQUEUE__WORKER__CONCURRENCY` or
//! `PANQUEUE__WORKER__PROMOTER__INTERVAL_MS`.

use serde::Deserialize;

use crate::error::Result;
use crate::jobs::connection::{ConnectionOptions, ConnectionParams};
use crate::jobs::worker::WorkerConfig;
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "PANQUEUE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis connection
    #[serde(default)]
    pub redis: RedisSettings,

    /// Consumer loop, including its promoter and recovery batch
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisSettings {
    /// Full connection URL. Takes precedence over the discrete fields.
    pub url: Option<String>,

    pub host: Option<String>,

    pub port: Option<u16>,

    pub password: Option<String>,

    pub db: Option<i64>,

    pub tls: Option<bool>,
}

impl RedisSettings {
    pub fn connection_options(&self) -> ConnectionOptions {
        match &self.url {
            Some(url) if !url.trim().is_empty() => ConnectionOptions::Url(url.clone()),
            _ => ConnectionOptions::Params(ConnectionParams {
                host: self.host.clone(),
                port: self.port,
                password: self.password.clone(),
                db: self.db,
                tls: self.tls,
            }),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
