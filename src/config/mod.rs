//! Configuration for sandpool.
//!
//! Settings are loaded with priority: env var > default. `SANDPOOL_DB_PATH`
//! and friends may live in `./.env` (loaded via dotenvy early in startup).
//! Pool sizing env vars only seed a fresh store; once persisted, the stored
//! settings win on restart.

use std::path::PathBuf;
use std::str::FromStr;

use crate::backend::DockerBackendConfig;
use crate::error::ConfigError;
use crate::pool::PoolSettings;

/// Main configuration for the pool service.
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub docker: DockerBackendConfig,
    pub pool: PoolDefaultsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            http: HttpConfig::resolve()?,
            store: StoreConfig::resolve()?,
            docker: DockerBackendConfig::resolve()?,
            pool: PoolDefaultsConfig::resolve()?,
        })
    }
}

/// Gateway HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 7070 }
    }
}

impl HttpConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_optional_env("SANDPOOL_PORT", defaults.port)?,
        })
    }
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database path (created on first run).
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sandpool.db"),
        }
    }
}

impl StoreConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            path: optional_env("SANDPOOL_DB_PATH")?
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
        })
    }
}

impl DockerBackendConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            image: parse_string_env("SANDPOOL_IMAGE", defaults.image)?,
            memory_limit_mb: parse_optional_env(
                "SANDPOOL_MEMORY_LIMIT_MB",
                defaults.memory_limit_mb,
            )?,
            cpu_shares: parse_optional_env("SANDPOOL_CPU_SHARES", defaults.cpu_shares)?,
            container_port: parse_optional_env("SANDPOOL_CONTAINER_PORT", defaults.container_port)?,
        })
    }
}

/// Pool sizing defaults, used only when the store has no persisted settings.
#[derive(Debug, Clone)]
pub struct PoolDefaultsConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub buffer_size: u32,
}

impl Default for PoolDefaultsConfig {
    fn default() -> Self {
        let settings = PoolSettings::default();
        Self {
            min_size: settings.min_size,
            max_size: settings.max_size,
            buffer_size: settings.buffer_size,
        }
    }
}

impl PoolDefaultsConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let resolved = Self {
            min_size: parse_optional_env("SANDPOOL_MIN_SIZE", defaults.min_size)?,
            max_size: parse_optional_env("SANDPOOL_MAX_SIZE", defaults.max_size)?,
            buffer_size: parse_optional_env("SANDPOOL_BUFFER_SIZE", defaults.buffer_size)?,
        };
        if resolved.min_size > resolved.max_size {
            return Err(ConfigError::InvalidValue {
                var: "SANDPOOL_MIN_SIZE".to_string(),
                reason: format!(
                    "min_size ({}) must not exceed max_size ({})",
                    resolved.min_size, resolved.max_size
                ),
            });
        }
        Ok(resolved)
    }

    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_size,
            max_size: self.max_size,
            buffer_size: self.buffer_size,
            current_size: 0,
        }
    }
}

// -- Env helpers --

/// Read an env var, treating unset and empty the same.
fn optional_env(var: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var) {
        Ok(val) if !val.trim().is_empty() => Ok(Some(val)),
        _ => Ok(None),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
fn parse_optional_env<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(var)? {
        Some(val) => val.trim().parse().map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("'{val}': {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_string_env(var: &str, default: String) -> Result<String, ConfigError> {
    Ok(optional_env(var)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_pool_sizing() {
        let pool = PoolDefaultsConfig::default();
        assert_eq!(pool.min_size, 2);
        assert_eq!(pool.max_size, 10);
        assert_eq!(pool.buffer_size, 2);
        assert_eq!(pool.to_settings().current_size, 0);
    }

    #[test]
    fn parse_optional_env_reads_and_falls_back() {
        std::env::set_var("SANDPOOL_TEST_PARSE_U32", "17");
        assert_eq!(parse_optional_env("SANDPOOL_TEST_PARSE_U32", 3u32).unwrap(), 17);
        assert_eq!(parse_optional_env("SANDPOOL_TEST_UNSET_U32", 3u32).unwrap(), 3);

        std::env::set_var("SANDPOOL_TEST_BAD_U32", "not-a-number");
        let err = parse_optional_env("SANDPOOL_TEST_BAD_U32", 3u32).unwrap_err();
        assert!(err.to_string().contains("SANDPOOL_TEST_BAD_U32"));
    }

    #[test]
    fn empty_env_var_counts_as_unset() {
        std::env::set_var("SANDPOOL_TEST_EMPTY", "   ");
        assert_eq!(optional_env("SANDPOOL_TEST_EMPTY").unwrap(), None);
    }
}
