use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::store::{DatabaseConfig, DatabaseType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub kube: KubeConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// Namespace to watch; `None` watches every namespace.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
    pub purge_interval_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 15,
            refresh_interval_seconds: 10,
            purge_interval_seconds: 60,
        }
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source, applying defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let defaults = CacheConfig::default();

        let config = Config {
            server: ServerConfig {
                addr: lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8585".to_string()),
            },
            database: DatabaseConfig {
                db_type: match lookup("DATABASE_TYPE")
                    .unwrap_or_else(|| "sqlite".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "sqlite" => DatabaseType::Sqlite,
                    "postgres" | "postgresql" => DatabaseType::Postgres,
                    other => {
                        return Err(crate::Error::Config(format!("Unknown DATABASE_TYPE '{}'", other)));
                    }
                },
                sqlite_path: lookup("SQLITE_PATH")
                    .map(PathBuf::from)
                    .or_else(|| Some(PathBuf::from("data/cronwatch.db"))),
                connection_string: lookup("DATABASE_URL"),
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            },
            kube: KubeConfig {
                namespace: lookup("K8_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            },
            cache: CacheConfig {
                ttl_seconds: parse_or(&lookup, "CACHE_TTL_SECONDS", defaults.ttl_seconds)?,
                refresh_interval_seconds: parse_or(
                    &lookup,
                    "REFRESH_INTERVAL_SECONDS",
                    defaults.refresh_interval_seconds,
                )?,
                purge_interval_seconds: parse_or(
                    &lookup,
                    "CACHE_PURGE_INTERVAL_SECONDS",
                    defaults.purge_interval_seconds,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.database.validate().map_err(crate::Error::Config)?;

        let intervals = [
            ("CACHE_TTL_SECONDS", self.cache.ttl_seconds),
            ("REFRESH_INTERVAL_SECONDS", self.cache.refresh_interval_seconds),
            ("CACHE_PURGE_INTERVAL_SECONDS", self.cache.purge_interval_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(crate::Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> crate::Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8585".to_string(),
            },
            database: DatabaseConfig::default(),
            kube: KubeConfig { namespace: None },
            cache: CacheConfig::default(),
        }
    }
}
