pub mod library;

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub app_mode: String,
    pub database_url: String,
    pub run_migrations: bool,
    pub library_config: String,
    pub queue_endpoint: String,
    pub queue_region: String,
    pub queue_name: String,
    pub db_max_connections: u32,
    pub db_connect_timeout_seconds: u64,
    pub db_idle_timeout_seconds: u64,
    pub db_max_lifetime_seconds: u64,
    pub worker_concurrency: usize,
    pub derivation_max_attempts: u32,
    pub derivation_backoff_ms: u64,
    pub derivation_max_backoff_ms: u64,
    pub storage_timeout_seconds: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let worker_concurrency: usize = env_or_parse("WORKER_CONCURRENCY", "4")?;
        if worker_concurrency == 0 {
            return Err(anyhow!("invalid WORKER_CONCURRENCY: must be at least 1"));
        }
        let derivation_max_attempts: u32 = env_or_parse("DERIVATION_MAX_ATTEMPTS", "3")?;
        if derivation_max_attempts == 0 {
            return Err(anyhow!("invalid DERIVATION_MAX_ATTEMPTS: must be at least 1"));
        }

        Ok(Self {
            app_mode: env_or("APP_MODE", "worker"),
            database_url: env_or_err("DATABASE_URL")?,
            run_migrations: env_or_parse("RUN_MIGRATIONS", "false")?,
            library_config: env_or("LIBRARY_CONFIG", "library.toml"),
            queue_endpoint: env_or_err("QUEUE_ENDPOINT")?,
            queue_region: env_or("QUEUE_REGION", "fr-par"),
            queue_name: env_or_err("QUEUE_NAME")?,
            db_max_connections: env_or_parse("DB_MAX_CONNECTIONS", "25")?,
            db_connect_timeout_seconds: env_or_parse("DB_CONNECT_TIMEOUT_SECONDS", "5")?,
            db_idle_timeout_seconds: env_or_parse("DB_IDLE_TIMEOUT_SECONDS", "300")?,
            db_max_lifetime_seconds: env_or_parse("DB_MAX_LIFETIME_SECONDS", "1800")?,
            worker_concurrency,
            derivation_max_attempts,
            derivation_backoff_ms: env_or_parse("DERIVATION_BACKOFF_MS", "500")?,
            derivation_max_backoff_ms: env_or_parse("DERIVATION_MAX_BACKOFF_MS", "30000")?,
            storage_timeout_seconds: env_opt_parse("STORAGE_TIMEOUT_SECONDS")?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.derivation_max_attempts,
            base_delay: Duration::from_millis(self.derivation_backoff_ms),
            max_delay: Duration::from_millis(self.derivation_max_backoff_ms),
        }
    }

    pub fn storage_timeout(&self) -> Option<Duration> {
        self.storage_timeout_seconds.map(Duration::from_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_err(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {}", key))
}

fn env_or_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
    value
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {}: {}", key, err))
}

fn env_opt_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("invalid {}: {}", key, err)),
        _ => Ok(None),
    }
}
