use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid rate limit requests_per_second: {0}. Must be positive")]
    InvalidRateLimit(f64),

    #[error("Invalid rate_limit.window_limit: {0}. Must be at least 1")]
    InvalidWindowLimit(usize),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid sandbox.max_source_bytes: {0}. Must be at least 1")]
    InvalidMaxSourceBytes(usize),

    #[error("Invalid repair_tracker.max_repairs_per_task: {0}. Cannot be 0")]
    InvalidMaxRepairsPerTask(u32),

    #[error("Invalid object_store.backend: {0}. Must be one of: filesystem, http")]
    InvalidObjectStoreBackend(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .autoforge/config.yaml (project config)
    /// 3. .autoforge/local.yaml (project local overrides, optional)
    /// 4. Environment variables (AUTOFORGE_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".autoforge/config.yaml"))
            .merge(Yaml::file(".autoforge/local.yaml"))
            .merge(Env::prefixed("AUTOFORGE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.rate_limit.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(
                config.rate_limit.requests_per_second,
            ));
        }
        if config.rate_limit.window_limit == 0 {
            return Err(ConfigError::InvalidWindowLimit(
                config.rate_limit.window_limit,
            ));
        }
        if config.rate_limit.initial_backoff_ms >= config.rate_limit.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.rate_limit.initial_backoff_ms,
                config.rate_limit.max_backoff_ms,
            ));
        }

        if config.sandbox.max_source_bytes == 0 {
            return Err(ConfigError::InvalidMaxSourceBytes(
                config.sandbox.max_source_bytes,
            ));
        }

        if config.repair_tracker.max_repairs_per_task == 0 {
            return Err(ConfigError::InvalidMaxRepairsPerTask(
                config.repair_tracker.max_repairs_per_task,
            ));
        }

        let valid_backends = ["filesystem", "http"];
        if !valid_backends.contains(&config.object_store.backend.as_str()) {
            return Err(ConfigError::InvalidObjectStoreBackend(
                config.object_store.backend.clone(),
            ));
        }
        if config.object_store.backend == "http" && config.object_store.base_url.is_none() {
            return Err(ConfigError::ValidationFailed(
                "object_store.base_url is required when backend is \"http\"".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{DatabaseConfig, LoggingConfig, RateLimitConfig};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!((config.rate_limit.requests_per_second - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.database.path, ".autoforge/autoforge.db");
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
rate_limit:
  requests_per_second: 15.0
  window_limit: 500
database:
  path: /custom/path.db
  max_connections: 5
logging:
  level: debug
  format: pretty
  retention_days: 7
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert!((config.rate_limit.requests_per_second - 15.0).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.window_limit, 500);
        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.retention_days, 7);

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config {
            database: DatabaseConfig {
                path: ".autoforge/autoforge.db".to_string(),
                max_connections: 10,
                connect_timeout_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
                ..Default::default()
            },
            rate_limit: RateLimitConfig::default(),
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        match result.unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            _ => panic!("Expected InvalidLogLevel error"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        match result.unwrap_err() {
            ConfigError::InvalidLogFormat(format) => assert_eq!(format, "xml"),
            _ => panic!("Expected InvalidLogFormat error"),
        }
    }

    #[test]
    fn test_validate_negative_rate_limit() {
        let mut config = Config::default();
        config.rate_limit.requests_per_second = -5.0;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidRateLimit(_)));
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::EmptyDatabasePath));
    }

    #[test]
    fn test_validate_zero_max_connections() {
        let mut config = Config::default();
        config.database.max_connections = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidMaxConnections(0)
        ));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.rate_limit.initial_backoff_ms = 30000;
        config.rate_limit.max_backoff_ms = 10000;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidBackoff(30000, 10000)
        ));
    }

    #[test]
    fn test_validate_http_backend_requires_base_url() {
        let mut config = Config::default();
        config.object_store.backend = "http".to_string();
        config.object_store.base_url = None;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            [
                ("AUTOFORGE_RATE_LIMIT__REQUESTS_PER_SECOND", Some("20.0")),
                ("AUTOFORGE_LOGGING__LEVEL", Some("debug")),
            ],
            || {
                let config: Config = Figment::new()
                    .merge(Serialized::defaults(Config::default()))
                    .merge(Env::prefixed("AUTOFORGE_").split("__"))
                    .extract()
                    .expect("env-only figment extraction should succeed");

                assert!((config.rate_limit.requests_per_second - 20.0).abs() < f64::EPSILON);
                assert_eq!(config.logging.level, "debug");
            },
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(base_file, "logging:\n  level: info\n  format: json").unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "logging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.logging.level, "debug", "Override should win");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
