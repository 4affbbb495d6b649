//! HTTP-backed collaborators: per-platform webhook adapters and the
//! reputation sink.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::action_sync::{AdapterError, PlatformAdapter};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdapterRequest<'a> {
    action: &'static str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Forwards actions to a platform bridge service over HTTP.
///
/// 2xx and 409 (already applied) count as success, any other 4xx is a
/// rejection, 5xx and network errors are transient.
#[derive(Clone)]
pub struct HttpPlatformAdapter {
    platform: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPlatformAdapter {
    pub fn new(platform: &str, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            platform: platform.to_string(),
            endpoint: format!("{}/actions", base_url.trim_end_matches('/')),
            client,
        }
    }

    async fn send(&self, body: AdapterRequest<'_>, idempotency_key: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        classify(response.status())
    }
}

fn classify(status: StatusCode) -> Result<(), AdapterError> {
    if status.is_success() || status == StatusCode::CONFLICT {
        Ok(())
    } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Err(AdapterError::Rejected(status.to_string()))
    } else {
        Err(AdapterError::Transient(status.to_string()))
    }
}

#[async_trait]
impl PlatformAdapter for HttpPlatformAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn timeout(&self, user_id: &str, duration_minutes: u32, idempotency_key: &str) -> Result<(), AdapterError> {
        let body = AdapterRequest {
            action: "timeout",
            user_id,
            duration_minutes: Some(duration_minutes),
            message: None,
        };
        self.send(body, idempotency_key).await
    }

    async fn ban(&self, user_id: &str, idempotency_key: &str) -> Result<(), AdapterError> {
        let body = AdapterRequest {
            action: "ban",
            user_id,
            duration_minutes: None,
            message: None,
        };
        self.send(body, idempotency_key).await
    }

    async fn warn(&self, user_id: &str, message: &str, idempotency_key: &str) -> Result<(), AdapterError> {
        let body = AdapterRequest {
            action: "warn",
            user_id,
            duration_minutes: None,
            message: Some(message),
        };
        self.send(body, idempotency_key).await
    }

    async fn kick(&self, user_id: &str, idempotency_key: &str) -> Result<(), AdapterError> {
        let body = AdapterRequest {
            action: "kick",
            user_id,
            duration_minutes: None,
            message: None,
        };
        self.send(body, idempotency_key).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationEvent {
    pub community_id: String,
    pub platform: String,
    pub user_id: String,
    pub delta: i32,
    pub reason: String,
}

/// Receives reputation deltas. Delivery is best effort.
#[async_trait]
pub trait ReputationSink: Send + Sync {
    async fn report(&self, event: ReputationEvent);
}

pub struct HttpReputationSink {
    url: String,
    client: reqwest::Client,
}

impl HttpReputationSink {
    pub fn new(url: &str, client: reqwest::Client) -> Self {
        Self {
            url: url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl ReputationSink for HttpReputationSink {
    async fn report(&self, event: ReputationEvent) {
        match self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(5))
            .json(&event)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(user_id = %event.user_id, delta = event.delta, "reputation reported");
            }
            Ok(response) => warn!(status = %response.status(), "reputation sink rejected event"),
            Err(e) => warn!(error = %e, "reputation sink unreachable"),
        }
    }
}

/// Parse `twitch=http://host/twitch,discord=http://host/discord`.
pub fn parse_adapter_list(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (platform, url) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected platform=url, got {entry:?}"))?;
            let (platform, url) = (platform.trim(), url.trim());
            if platform.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("invalid adapter entry {entry:?}"));
            }
            Ok((platform.to_lowercase(), url.to_string()))
        })
        .collect()
}
