use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::connection_pool::{
    PoolCacheConfig, DEFAULT_CACHE_IDLE_TIMEOUT_SECS, DEFAULT_CACHE_MAX_SIZE, DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::validation::ValidatorConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub pool_cache: PoolCacheSettings,
    pub query: QuerySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolCacheSettings {
    pub max_size: usize,
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
    pub default_max_rows: u64,
    pub default_timeout_secs: u64,
    pub medium_timeout_secs: u64,
    pub extended_timeout_secs: u64,
}

/// (environment variable, config key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("RUST_LOG", "logging.level"),
    ("POOL_CACHE_MAX_SIZE", "pool_cache.max_size"),
    ("POOL_CACHE_SWEEP_INTERVAL_SECS", "pool_cache.sweep_interval_secs"),
    ("POOL_CACHE_IDLE_TIMEOUT_SECS", "pool_cache.idle_timeout_secs"),
    ("QUERY_DEFAULT_MAX_ROWS", "query.default_max_rows"),
    ("QUERY_DEFAULT_TIMEOUT_SECS", "query.default_timeout_secs"),
    ("QUERY_MEDIUM_TIMEOUT_SECS", "query.medium_timeout_secs"),
    ("QUERY_EXTENDED_TIMEOUT_SECS", "query.extended_timeout_secs"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let validator = ValidatorConfig::default();
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("pool_cache.max_size", DEFAULT_CACHE_MAX_SIZE as u64)?
            .set_default("pool_cache.sweep_interval_secs", DEFAULT_SWEEP_INTERVAL_SECS)?
            .set_default("pool_cache.idle_timeout_secs", DEFAULT_CACHE_IDLE_TIMEOUT_SECS)?
            .set_default("query.default_max_rows", validator.default_max_rows)?
            .set_default("query.default_timeout_secs", validator.default_timeout_secs)?
            .set_default("query.medium_timeout_secs", validator.medium_timeout_secs)?
            .set_default("query.extended_timeout_secs", validator.extended_timeout_secs)?;

        // Strings are coerced to the target type on deserialize
        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), config::ConfigError> {
        if self.pool_cache.max_size == 0 {
            return Err(config::ConfigError::Message("pool_cache.max_size must be at least 1".into()));
        }
        if self.pool_cache.sweep_interval_secs == 0 || self.pool_cache.idle_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "pool_cache intervals must be greater than zero".into(),
            ));
        }
        if self.query.default_max_rows == 0 || self.query.default_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "query.default_max_rows and query.default_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn pool_cache_config(&self) -> PoolCacheConfig {
        PoolCacheConfig {
            max_size: self.pool_cache.max_size,
            sweep_interval: Duration::from_secs(self.pool_cache.sweep_interval_secs),
            idle_timeout: Duration::from_secs(self.pool_cache.idle_timeout_secs),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            default_max_rows: self.query.default_max_rows,
            default_timeout_secs: self.query.default_timeout_secs,
            medium_timeout_secs: self.query.medium_timeout_secs,
            extended_timeout_secs: self.query.extended_timeout_secs,
            ..ValidatorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        for (var, _) in ENV_OVERRIDES {
            env::remove_var(var);
        }

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");

        let cache = config.pool_cache_config();
        assert_eq!(cache.max_size, 10);
        assert_eq!(cache.sweep_interval, Duration::from_secs(60));
        assert_eq!(cache.idle_timeout, Duration::from_secs(300));

        let validator = config.validator_config();
        assert_eq!(validator.default_max_rows, 1000);
        assert_eq!(validator.extended_timeout_secs, 120);
    }
}
