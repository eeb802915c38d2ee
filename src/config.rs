//! Configuration surface (§6): the flat set of fields the core reads,
//! independent of whether they arrived from a TOML file, environment
//! variables, or CLI flags (that layering lives in `src/bin/server.rs`).

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_lease_ttl_seconds() -> u64 {
    30
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_flush_parallelism() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_block_size_bytes() -> u32 {
    131072
}

/// Server configuration as described in spec.md §6.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub export_size_bytes: u64,

    #[serde(default = "default_block_size_bytes")]
    pub block_size_bytes: u32,

    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_bucket: String,
    pub s3_region: String,

    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_flush_parallelism")]
    pub flush_parallelism: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size_bytes != default_block_size_bytes() {
            return Err(ConfigError::Invalid(format!(
                "block_size_bytes must be {}, got {}",
                default_block_size_bytes(),
                self.block_size_bytes
            )));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.s3_bucket.is_empty() {
            return Err(ConfigError::Invalid(
                "s3_bucket must not be empty".to_string(),
            ));
        }
        if self.export_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "export_size_bytes must be positive".to_string(),
            ));
        }
        if self.flush_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "flush_parallelism must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_seconds * 2 >= self.lease_ttl_seconds {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_seconds ({}) must leave a safety margin under half of lease_ttl_seconds ({}), per the clock-skew assumption in spec.md §9",
                self.heartbeat_interval_seconds, self.lease_ttl_seconds
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> &'static str {
        r#"
host = "0.0.0.0"
port = 10809
export_size_bytes = 1073741824
s3_endpoint = "http://localhost:9000"
s3_access_key = "minioadmin"
s3_secret_key = "minioadmin"
s3_bucket = "nbd-export"
s3_region = "us-east-1"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(minimal_config()).unwrap();
        assert_eq!(config.port, 10809);
        assert_eq!(config.block_size_bytes, 131072);
        assert_eq!(config.lease_ttl_seconds, 30);
        assert_eq!(config.heartbeat_interval_seconds, 15);
        assert_eq!(config.flush_parallelism, 10);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_non_standard_block_size() {
        let bad = format!("{}\nblock_size_bytes = 4096\n", minimal_config());
        let result = Config::parse(&bad);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_empty_bucket() {
        let bad = minimal_config().replace("nbd-export", "");
        let result = Config::parse(&bad);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_heartbeat_too_close_to_ttl() {
        let bad = format!(
            "{}\nlease_ttl_seconds = 10\nheartbeat_interval_seconds = 8\n",
            minimal_config()
        );
        let result = Config::parse(&bad);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bind_addr_combines_host_and_port() {
        let config = Config::parse(minimal_config()).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:10809");
    }

    #[test]
    fn loads_from_a_toml_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd-object-server.toml");
        std::fs::write(&path, minimal_config()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.s3_bucket, "nbd-export");
    }

    #[test]
    fn load_surfaces_io_error_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
