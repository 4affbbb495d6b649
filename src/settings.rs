use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::security::platforms::parse_adapter_list;
use crate::security::RetryPolicy;

const DEFAULT_SECRET: &str = "change-this-secret-in-production";

/// Process settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// `memory` selects the in-process store.
    pub redis_url: String,
    pub database_url: String,
    pub server_secret: String,
    pub platform_adapters: Vec<(String, String)>,
    pub reputation_url: Option<String>,
    pub sync_max_attempts: u32,
    pub sync_attempt_timeout: Duration,
    pub sync_bucket: Duration,
    pub request_timeout: Duration,
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key}={raw:?} is invalid: {e}")),
        None => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_secret = lookup("SERVER_SECRET").unwrap_or_else(|| {
            warn!("SERVER_SECRET not set, using the default (NOT SECURE for production)");
            DEFAULT_SECRET.to_string()
        });

        let platform_adapters = match lookup("PLATFORM_ADAPTERS") {
            Some(raw) => parse_adapter_list(&raw)
                .map_err(|e| anyhow!(e))
                .context("PLATFORM_ADAPTERS is invalid")?,
            None => Vec::new(),
        };

        let sync_max_attempts: u32 = parsed(&lookup, "SYNC_MAX_ATTEMPTS", 3)?;
        if sync_max_attempts == 0 {
            return Err(anyhow!("SYNC_MAX_ATTEMPTS must be at least 1"));
        }

        Ok(Self {
            bind_addr: parsed(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3001)))?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "gatekeeper.db".to_string()),
            server_secret,
            platform_adapters,
            reputation_url: lookup("REPUTATION_URL"),
            sync_max_attempts,
            sync_attempt_timeout: Duration::from_millis(parsed(&lookup, "SYNC_ATTEMPT_TIMEOUT_MS", 5000)?),
            sync_bucket: Duration::from_secs(parsed(&lookup, "SYNC_BUCKET_SECONDS", 300)?),
            request_timeout: Duration::from_secs(parsed(&lookup, "REQUEST_TIMEOUT_SECS", 10)?),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync_max_attempts,
            attempt_timeout: self.sync_attempt_timeout,
            bucket: self.sync_bucket,
            ..RetryPolicy::default()
        }
    }
}
