//! Configuration management for the gateway.
//!
//! Configuration is set via environment variables:
//! - `API_PORT` - Optional. Listen port. Defaults to `8899`.
//! - `ADMIN_PASSWORD` - Optional. Shared admin bearer. Defaults to `admin123`.
//! - `DEFAULT_COOLDOWN_SECONDS` - Optional. Initial pool cooldown. Defaults to `60`.
//! - `VIRTUAL_MODEL_TOOL` - Optional. Virtual name for the `tool` pool. Defaults to `haiku`.
//! - `VIRTUAL_MODEL_NORMAL` - Optional. Virtual name for the `normal` pool. Defaults to `sonnet`.
//! - `VIRTUAL_MODEL_ADVANCED` - Optional. Virtual name for the `advanced` pool. Defaults to `opus`.
//! - `DATABASE_PATH` - Optional. SQLite file path. Defaults to `gateway.db`.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::PoolTag;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port.
    pub port: u16,

    /// Shared password for the admin surface.
    pub admin_password: String,

    /// Cooldown seeded into pool configs on first boot.
    pub default_cooldown_secs: u64,

    /// Virtual model name per pool, in `PoolTag::ALL` order.
    pub virtual_models: [String; 3],

    /// SQLite database file.
    pub database_path: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_or("API_PORT", "8899")
            .parse()
            .map_err(|e| ConfigError::InvalidValue("API_PORT".to_string(), format!("{}", e)))?;

        let default_cooldown_secs = env_or("DEFAULT_COOLDOWN_SECONDS", "60")
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("DEFAULT_COOLDOWN_SECONDS".to_string(), format!("{}", e))
            })?;

        Ok(Self {
            port,
            admin_password: env_or("ADMIN_PASSWORD", "admin123"),
            default_cooldown_secs,
            virtual_models: [
                env_or("VIRTUAL_MODEL_TOOL", "haiku"),
                env_or("VIRTUAL_MODEL_NORMAL", "sonnet"),
                env_or("VIRTUAL_MODEL_ADVANCED", "opus"),
            ],
            database_path: PathBuf::from(env_or("DATABASE_PATH", "gateway.db")),
        })
    }

    /// Virtual model name configured for a pool.
    pub fn virtual_model(&self, tag: PoolTag) -> &str {
        &self.virtual_models[tag as usize]
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8899,
            admin_password: "admin123".to_string(),
            default_cooldown_secs: 60,
            virtual_models: [
                "haiku".to_string(),
                "sonnet".to_string(),
                "opus".to_string(),
            ],
            database_path: PathBuf::from("gateway.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8899);
        assert_eq!(config.virtual_model(PoolTag::Tool), "haiku");
        assert_eq!(config.virtual_model(PoolTag::Normal), "sonnet");
        assert_eq!(config.virtual_model(PoolTag::Advanced), "opus");
    }
}
