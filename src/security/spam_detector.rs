//! Burst and duplicate-message detection.
//!
//! Both checks share one short history per user in the ephemeral store
//! (`spam:<community>:<platform>:<user>:messages`): a capped list of
//! `<timestamp_ms>:<fingerprint>` entries, newest first, whose TTL is the
//! spam interval. The fingerprint hashes the normalized text so message
//! bodies never sit in the store.
//!
//! A separate `:flagged` marker lives for one spam interval after a
//! detection, so a flood reports `first_detection` once.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ephemeral::EphemeralStore;
use crate::security::SecurityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamReason {
    /// Too many messages inside the spam interval.
    Burst { count: u32 },
    /// The same normalized text repeated.
    Duplicate { count: u32 },
}

impl SpamReason {
    pub fn code(&self) -> &'static str {
        match self {
            SpamReason::Burst { .. } => "burst",
            SpamReason::Duplicate { .. } => "duplicate",
        }
    }
}

/// Near-identical messages in the duplicate window that flag spam.
pub const DUPLICATE_MATCHES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpamVerdict {
    pub reason: Option<SpamReason>,
    /// No earlier detection for this user within the spam interval.
    pub first_detection: bool,
    pub degraded: bool,
}

impl SpamVerdict {
    pub fn is_spam(&self) -> bool {
        self.reason.is_some()
    }
}

/// Case-fold, drop punctuation and collapse whitespace.
pub fn normalize_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fingerprint(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

pub fn history_key(community_id: &str, platform: &str, user_id: &str) -> String {
    format!("spam:{}:{}:{}:messages", community_id, platform, user_id)
}

pub fn flagged_key(community_id: &str, platform: &str, user_id: &str) -> String {
    format!("spam:{}:{}:{}:flagged", community_id, platform, user_id)
}

#[derive(Clone)]
pub struct SpamDetector {
    store: Arc<dyn EphemeralStore>,
}

impl SpamDetector {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        message: &str,
        config: &SecurityConfig,
    ) -> SpamVerdict {
        self.check_at(community_id, platform, user_id, message, config, Utc::now().timestamp_millis())
            .await
    }

    pub async fn check_at(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        message: &str,
        config: &SecurityConfig,
        now_ms: i64,
    ) -> SpamVerdict {
        if !config.spam_enabled {
            return SpamVerdict::default();
        }

        let burst_threshold = config.spam_message_threshold;
        // Previous messages compared against the current one.
        let duplicate_window = config.spam_duplicate_threshold;
        if burst_threshold == 0 && duplicate_window == 0 {
            return SpamVerdict::default();
        }

        let interval_secs = u64::from(config.spam_interval_seconds.max(1));
        let cap = (burst_threshold as usize).max(duplicate_window as usize + 1);
        let current = fingerprint(&normalize_message(message));
        let entry = format!("{}:{}", now_ms, current);

        let history = match self
            .store
            .push_recent(&history_key(community_id, platform, user_id), &entry, cap, interval_secs)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(degraded = true, community_id, error = %e, "spam history unavailable; failing open");
                metrics::counter!("gatekeeper_degraded_total", 1, "component" => "spam_detector");
                return SpamVerdict {
                    reason: None,
                    first_detection: false,
                    degraded: true,
                };
            }
        };

        let entries: Vec<(i64, &str)> = history
            .iter()
            .filter_map(|raw| {
                let (ts, hash) = raw.split_once(':')?;
                Some((ts.parse().ok()?, hash))
            })
            .collect();

        let mut reason = None;
        if burst_threshold > 0 {
            let window_start = now_ms - (interval_secs as i64) * 1000;
            let count = entries.iter().filter(|(ts, _)| *ts > window_start).count() as u32;
            if count >= burst_threshold {
                debug!(community_id, user_id, count, "burst spam detected");
                reason = Some(SpamReason::Burst { count });
            }
        }

        if reason.is_none() && duplicate_window > 0 {
            // The newest entry is the current message.
            let count = entries
                .iter()
                .take(duplicate_window as usize + 1)
                .filter(|(_, hash)| *hash == current)
                .count() as u32;
            if count >= DUPLICATE_MATCHES {
                debug!(community_id, user_id, count, "duplicate spam detected");
                reason = Some(SpamReason::Duplicate { count });
            }
        }

        match reason {
            Some(reason) => SpamVerdict {
                reason: Some(reason),
                first_detection: self.flag(community_id, platform, user_id, interval_secs).await,
                degraded: false,
            },
            None => SpamVerdict::default(),
        }
    }

    /// Set the flagged marker; true when none was live.
    async fn flag(&self, community_id: &str, platform: &str, user_id: &str, interval_secs: u64) -> bool {
        let key = flagged_key(community_id, platform, user_id);
        let already = match self.store.exists(&key).await {
            Ok(already) => already,
            Err(e) => {
                warn!(degraded = true, community_id, error = %e, "spam flag unavailable");
                return true;
            }
        };
        if !already {
            if let Err(e) = self.store.mark(&key, interval_secs).await {
                warn!(degraded = true, community_id, error = %e, "failed to set spam flag");
            }
        }
        !already
    }
}
