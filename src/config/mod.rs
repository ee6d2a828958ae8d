use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tuning knobs of the serving engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub candidate_cache_ttl_secs: u64,
    pub candidate_cache_max_entries: u64,
    pub ad_cache_ttl_secs: u64,
    pub dedup_ttl_secs: u64,
    pub dedup_max_entries: u64,
    pub reconcile_interval_secs: u64,
    pub record_retry_attempts: u32,
    pub selection_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candidate_cache_ttl_secs: 30,
            candidate_cache_max_entries: 10_000,
            ad_cache_ttl_secs: 60,
            dedup_ttl_secs: 86_400,
            dedup_max_entries: 1_000_000,
            reconcile_interval_secs: 180,
            record_retry_attempts: 3,
            selection_timeout_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn candidate_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.candidate_cache_ttl_secs)
    }

    pub fn ad_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.ad_cache_ttl_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./tubeads.db".to_string());
        let max_connections = env_or("DATABASE_MAX_CONNECTIONS", 10u32)?;

        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_or("SERVER_PORT", 3000u16)?;

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            candidate_cache_ttl_secs: env_or(
                "CANDIDATE_CACHE_TTL_SECS",
                defaults.candidate_cache_ttl_secs,
            )?,
            candidate_cache_max_entries: env_or(
                "CANDIDATE_CACHE_MAX_ENTRIES",
                defaults.candidate_cache_max_entries,
            )?,
            ad_cache_ttl_secs: env_or("AD_CACHE_TTL_SECS", defaults.ad_cache_ttl_secs)?,
            dedup_ttl_secs: env_or("DEDUP_TTL_SECS", defaults.dedup_ttl_secs)?,
            dedup_max_entries: env_or("DEDUP_MAX_ENTRIES", defaults.dedup_max_entries)?,
            reconcile_interval_secs: env_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
            record_retry_attempts: env_or(
                "RECORD_RETRY_ATTEMPTS",
                defaults.record_retry_attempts,
            )?,
            selection_timeout_ms: env_or("SELECTION_TIMEOUT_MS", defaults.selection_timeout_ms)?,
        };

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            server: ServerConfig { host, port },
            engine,
        })
    }
}
