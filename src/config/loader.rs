//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered in order:
//! built-in defaults, `broker.toml`, `broker.{environment}.toml`, then
//! `BROKER_*` environment variables and `DATABASE_URL`.

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::BrokerConfig;
use crate::error::Result;

/// Builds a [`BrokerConfig`] from layered sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_directory: PathBuf,
    environment: String,
    read_environment: bool,
}

impl ConfigLoader {
    /// Load configuration from `./config` with environment auto-detection
    pub fn load() -> Result<BrokerConfig> {
        Self::new(Self::default_config_directory(), Self::detect_environment()).build()
    }

    /// Load defaults overlaid with a single required file, ignoring the environment
    pub fn load_file(path: impl AsRef<Path>) -> Result<BrokerConfig> {
        let defaults = Config::try_from(&BrokerConfig::default())?;
        let config: BrokerConfig = Config::builder()
            .add_source(defaults)
            .add_source(File::from(path.as_ref()).required(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn new(config_directory: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            config_directory: config_directory.into(),
            environment: environment.into(),
            read_environment: true,
        }
    }

    /// Skip `BROKER_*` and `DATABASE_URL`; useful where tests share a process environment
    pub fn without_environment_variables(mut self) -> Self {
        self.read_environment = false;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Build and validate the configuration
    pub fn build(&self) -> Result<BrokerConfig> {
        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            self.environment,
            self.config_directory.display()
        );

        let base_file = self.config_directory.join("broker.toml");
        let env_file = self
            .config_directory
            .join(format!("broker.{}.toml", self.environment));

        let mut builder = Config::builder()
            .add_source(Config::try_from(&BrokerConfig::default())?)
            .add_source(File::from(base_file).required(false))
            .add_source(File::from(env_file).required(false));

        if self.read_environment {
            builder = builder.add_source(
                Environment::with_prefix("BROKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

            if let Ok(database_url) = env::var("DATABASE_URL") {
                builder = builder.set_override("database.url", database_url)?;
            }
        }

        let config: BrokerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            environment = %self.environment,
            database_url = %mask_database_url(&config.database.url),
            table = %config.database.table_name,
            poll_timeout_ms = config.consumer.poll_timeout_ms,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("BROKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("BROKER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}

/// Mask the password component of a database URL for logging
pub fn mask_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };

    match credentials.split_once(':') {
        Some((user, _password)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
