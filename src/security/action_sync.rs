//! Fan-out of decided moderation actions to platform adapters.
//!
//! Each target platform is handled by its own task with an isolated retry
//! loop. A successful `(platform, idempotency key)` pair is remembered in the
//! ephemeral store for one time bucket so a repeated dispatch reports
//! `alreadyApplied` instead of calling the adapter again. The key itself is
//! also handed to the adapter so the platform can drop duplicates on its side.

use async_trait::async_trait;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::ephemeral::EphemeralStore;
use crate::models::{Enforcement, ModerationAction, SyncOutcome};

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Worth retrying: network failure, 5xx, platform throttling.
    #[error("transient platform failure: {0}")]
    Transient(String),
    #[error("platform rejected the action: {0}")]
    Rejected(String),
    #[error("{0} does not support this action")]
    Unsupported(String),
}

/// Capability interface implemented once per chat platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> &str;

    async fn timeout(&self, user_id: &str, duration_minutes: u32, idempotency_key: &str) -> Result<(), AdapterError>;

    async fn ban(&self, user_id: &str, idempotency_key: &str) -> Result<(), AdapterError>;

    async fn warn(&self, user_id: &str, message: &str, idempotency_key: &str) -> Result<(), AdapterError>;

    async fn kick(&self, _user_id: &str, _idempotency_key: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported(self.platform().to_string()))
    }
}

async fn apply(adapter: &dyn PlatformAdapter, action: &ModerationAction, key: &str) -> Result<(), AdapterError> {
    let user = action.platform_user_id.as_str();
    match action.enforcement {
        Enforcement::Warn => adapter.warn(user, &action.reason, key).await,
        Enforcement::Timeout { duration_minutes } => adapter.timeout(user, duration_minutes, key).await,
        Enforcement::Kick => adapter.kick(user, key).await,
        Enforcement::Ban => adapter.ban(user, key).await,
    }
}

/// Adapters keyed by platform name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform().to_string(), adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.adapters.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Attempts, backoff schedule and idempotency-key derivation for syncs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_factor: u32,
    pub attempt_timeout: Duration,
    /// Width of the time bucket folded into the idempotency key.
    pub bucket: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            backoff_factor: 4,
            attempt_timeout: Duration::from_secs(5),
            bucket: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): 200ms, 800ms, 3200ms...
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_backoff
            .saturating_mul(self.backoff_factor.saturating_pow(exponent))
    }

    /// `sha256(community:user:action:bucket)` in hex. Two actions of the same
    /// type against the same user inside one bucket share a key. Timeouts
    /// carry their duration so an escalated timeout is not swallowed by the
    /// shorter one before it.
    pub fn idempotency_key(&self, action: &ModerationAction) -> String {
        let bucket_secs = self.bucket.as_secs().max(1) as i64;
        let bucket = action.created_at.timestamp().div_euclid(bucket_secs);
        // Timeouts key as `timeout/<minutes>`, not the bare action type.
        let kind = match action.enforcement.duration_minutes() {
            Some(minutes) => format!("{}/{}", action.enforcement.as_str(), minutes),
            None => action.enforcement.as_str().to_string(),
        };
        let combined = format!(
            "{}:{}:{}:{}",
            action.community_id, action.platform_user_id, kind, bucket
        );
        hex::encode(Sha256::digest(combined.as_bytes()))
    }
}

fn applied_marker(platform: &str, key: &str) -> String {
    format!("sync:{}:{}", platform, key)
}

#[derive(Clone)]
pub struct ActionSynchronizer {
    adapters: AdapterRegistry,
    store: Arc<dyn EphemeralStore>,
    db: Database,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl ActionSynchronizer {
    pub fn new(
        adapters: AdapterRegistry,
        store: Arc<dyn EphemeralStore>,
        db: Database,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adapters,
            store,
            db,
            policy,
            shutdown,
        }
    }

    pub fn platforms(&self) -> Vec<String> {
        self.adapters.platforms()
    }

    /// Assign the idempotency key and targets, mark every target pending and
    /// write the audit row.
    pub async fn prepare(&self, mut action: ModerationAction, targets: &[String]) -> ModerationAction {
        let mut unique: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(target) {
                unique.push(target.clone());
            }
        }

        if action.idempotency_key.is_none() {
            action.idempotency_key = Some(self.policy.idempotency_key(&action));
        }
        action.sync_results = unique
            .iter()
            .map(|platform| (platform.clone(), SyncOutcome::Pending))
            .collect();
        action.sync_targets = unique;

        if let Err(e) = self.db.audit().insert_action(&action).await {
            warn!(action_id = %action.id, error = %e, "failed to persist moderation action");
        }
        action
    }

    /// Sync to every target and record the results. Platforms run
    /// concurrently and a failure on one never affects the others.
    pub async fn dispatch(
        &self,
        action: ModerationAction,
        targets: &[String],
        cancel: CancellationToken,
    ) -> ModerationAction {
        let action = self.prepare(action, targets).await;
        self.deliver(action, cancel).await
    }

    /// Fire-and-forget `dispatch` under the service shutdown token.
    pub fn spawn_dispatch(&self, action: ModerationAction, targets: Vec<String>) -> JoinHandle<ModerationAction> {
        let synchronizer = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { synchronizer.dispatch(action, &targets, cancel).await })
    }

    /// Fire-and-forget `deliver` for an action already returned by `prepare`.
    pub fn spawn_delivery(&self, action: ModerationAction) -> JoinHandle<ModerationAction> {
        let synchronizer = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { synchronizer.deliver(action, cancel).await })
    }

    pub async fn deliver(&self, mut action: ModerationAction, cancel: CancellationToken) -> ModerationAction {
        let key = match &action.idempotency_key {
            Some(key) => key.clone(),
            None => self.policy.idempotency_key(&action),
        };

        let outcomes = join_all(
            action
                .sync_targets
                .iter()
                .map(|platform| self.sync_platform(platform, &action, &key, &cancel)),
        )
        .await;

        for (platform, outcome) in action.sync_targets.clone().into_iter().zip(outcomes) {
            metrics::counter!("sync_attempts_total", 1, "platform" => platform.clone(), "outcome" => outcome.label());
            action.sync_results.insert(platform, outcome);
        }

        if let Err(e) = self.db.audit().update_sync_results(&action).await {
            warn!(action_id = %action.id, error = %e, "failed to record sync results");
        }
        info!(
            action_id = %action.id,
            community_id = %action.community_id,
            action_type = action.enforcement.as_str(),
            "moderation action synced"
        );
        action
    }

    async fn sync_platform(
        &self,
        platform: &str,
        action: &ModerationAction,
        key: &str,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let Some(adapter) = self.adapters.get(platform) else {
            warn!(platform, action_id = %action.id, "no adapter registered");
            return SyncOutcome::NoAdapter;
        };

        let marker = applied_marker(platform, key);
        match self.store.exists(&marker).await {
            Ok(true) => {
                debug!(platform, action_id = %action.id, "already applied in this bucket");
                return SyncOutcome::AlreadyApplied;
            }
            Ok(false) => {}
            Err(e) => warn!(degraded = true, platform, error = %e, "sync dedup marker unavailable"),
        }

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return SyncOutcome::Cancelled { attempts: attempt - 1 };
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return SyncOutcome::Cancelled { attempts: attempt },
                result = tokio::time::timeout(self.policy.attempt_timeout, apply(adapter.as_ref(), action, key)) => result,
            };

            match result {
                Ok(Ok(())) => {
                    if let Err(e) = self.store.mark(&marker, self.policy.bucket.as_secs().max(1)).await {
                        warn!(degraded = true, platform, error = %e, "failed to set sync dedup marker");
                    }
                    return SyncOutcome::Applied { attempts: attempt };
                }
                Ok(Err(AdapterError::Transient(e))) => last_error = e,
                Ok(Err(e)) => {
                    warn!(platform, action_id = %action.id, error = %e, "platform sync failed");
                    return SyncOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
                Err(_) => last_error = format!("attempt timed out after {:?}", self.policy.attempt_timeout),
            }

            warn!(platform, action_id = %action.id, attempt, error = %last_error, "platform sync attempt failed");
            if attempt < self.policy.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return SyncOutcome::Cancelled { attempts: attempt },
                    _ = tokio::time::sleep(self.policy.backoff_for(attempt)) => {}
                }
            }
        }

        SyncOutcome::Failed {
            attempts: self.policy.max_attempts.max(1),
            error: last_error,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ephemeral::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted adapter that counts calls and replays queued results.
    pub(crate) struct MockAdapter {
        name: String,
        script: Mutex<VecDeque<Result<(), AdapterError>>>,
        pub calls: Mutex<Vec<(String, String)>>,
        hang: bool,
    }

    impl MockAdapter {
        pub(crate) fn new(name: &str) -> Arc<Self> {
            Self::scripted(name, vec![])
        }

        pub(crate) fn scripted(name: &str, script: Vec<Result<(), AdapterError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                hang: false,
            })
        }

        fn hanging(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                hang: true,
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        async fn record(&self, call: String, key: &str) -> Result<(), AdapterError> {
            self.calls.lock().unwrap().push((call, key.to_string()));
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    #[async_trait]
    impl PlatformAdapter for MockAdapter {
        fn platform(&self) -> &str {
            &self.name
        }

        async fn timeout(&self, user_id: &str, duration_minutes: u32, key: &str) -> Result<(), AdapterError> {
            self.record(format!("timeout {user_id} {duration_minutes}"), key).await
        }

        async fn ban(&self, user_id: &str, key: &str) -> Result<(), AdapterError> {
            self.record(format!("ban {user_id}"), key).await
        }

        async fn warn(&self, user_id: &str, _message: &str, key: &str) -> Result<(), AdapterError> {
            self.record(format!("warn {user_id}"), key).await
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
            ..RetryPolicy::default()
        }
    }

    async fn synchronizer(adapters: Vec<Arc<MockAdapter>>) -> ActionSynchronizer {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        ActionSynchronizer::new(
            registry,
            Arc::new(MemoryStore::new()),
            Database::new(":memory:").await.unwrap(),
            fast_policy(),
            CancellationToken::new(),
        )
    }

    fn timeout_action() -> ModerationAction {
        ModerationAction::new(
            "c1",
            "twitch",
            "u1",
            Enforcement::Timeout { duration_minutes: 5 },
            "spam".into(),
            None,
        )
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(3200));
    }

    #[test]
    fn test_idempotency_key_is_stable_within_bucket() {
        let policy = RetryPolicy::default();
        let first = timeout_action();
        let mut second = timeout_action();
        second.created_at = first.created_at;
        assert_eq!(policy.idempotency_key(&first), policy.idempotency_key(&second));
        assert_eq!(policy.idempotency_key(&first).len(), 64);

        let mut later = timeout_action();
        later.created_at = first.created_at + chrono::Duration::seconds(301);
        assert_ne!(policy.idempotency_key(&first), policy.idempotency_key(&later));

        let mut ban = timeout_action();
        ban.created_at = first.created_at;
        ban.enforcement = Enforcement::Ban;
        assert_ne!(policy.idempotency_key(&first), policy.idempotency_key(&ban));

        let mut longer = timeout_action();
        longer.created_at = first.created_at;
        longer.enforcement = Enforcement::Timeout { duration_minutes: 60 };
        assert_ne!(policy.idempotency_key(&first), policy.idempotency_key(&longer));
    }

    #[tokio::test]
    async fn test_dispatch_applies_on_every_target() {
        let twitch = MockAdapter::new("twitch");
        let discord = MockAdapter::new("discord");
        let sync = synchronizer(vec![twitch.clone(), discord.clone()]).await;

        let action = sync
            .dispatch(timeout_action(), &targets(&["twitch", "discord", "twitch"]), CancellationToken::new())
            .await;

        assert_eq!(action.sync_targets, targets(&["twitch", "discord"]));
        assert_eq!(action.sync_results["twitch"], SyncOutcome::Applied { attempts: 1 });
        assert_eq!(action.sync_results["discord"], SyncOutcome::Applied { attempts: 1 });
        assert_eq!(twitch.call_count(), 1);
        assert_eq!(twitch.calls.lock().unwrap()[0].0, "timeout u1 5");

        let stored = sync.db.audit().get_action(&action.id).await.unwrap();
        assert_eq!(stored.sync_results, action.sync_results);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_applies_once() {
        let twitch = MockAdapter::new("twitch");
        let sync = synchronizer(vec![twitch.clone()]).await;

        let first = timeout_action();
        let mut second = timeout_action();
        second.created_at = first.created_at;

        let first = sync.dispatch(first, &targets(&["twitch"]), CancellationToken::new()).await;
        let second = sync.dispatch(second, &targets(&["twitch"]), CancellationToken::new()).await;

        assert_eq!(first.idempotency_key, second.idempotency_key);
        assert_eq!(second.sync_results["twitch"], SyncOutcome::AlreadyApplied);
        assert_eq!(twitch.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let twitch = MockAdapter::scripted(
            "twitch",
            vec![
                Err(AdapterError::Transient("502".into())),
                Err(AdapterError::Transient("503".into())),
                Ok(()),
            ],
        );
        let sync = synchronizer(vec![twitch.clone()]).await;

        let action = sync
            .dispatch(timeout_action(), &targets(&["twitch"]), CancellationToken::new())
            .await;
        assert_eq!(action.sync_results["twitch"], SyncOutcome::Applied { attempts: 3 });
        assert_eq!(twitch.call_count(), 3);

        let keys: Vec<String> = twitch.calls.lock().unwrap().iter().map(|(_, k)| k.clone()).collect();
        assert!(keys.iter().all(|k| Some(k) == action.idempotency_key.as_ref()));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_platform() {
        let twitch = MockAdapter::scripted(
            "twitch",
            vec![
                Err(AdapterError::Transient("down".into())),
                Err(AdapterError::Transient("down".into())),
                Err(AdapterError::Transient("down".into())),
            ],
        );
        let discord = MockAdapter::new("discord");
        let sync = synchronizer(vec![twitch.clone(), discord.clone()]).await;

        let action = sync
            .dispatch(timeout_action(), &targets(&["twitch", "discord", "slack"]), CancellationToken::new())
            .await;

        assert!(matches!(
            action.sync_results["twitch"],
            SyncOutcome::Failed { attempts: 3, .. }
        ));
        assert_eq!(action.sync_results["discord"], SyncOutcome::Applied { attempts: 1 });
        assert_eq!(action.sync_results["slack"], SyncOutcome::NoAdapter);
        assert_eq!(twitch.call_count(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let twitch = MockAdapter::scripted("twitch", vec![Err(AdapterError::Rejected("403".into()))]);
        let sync = synchronizer(vec![twitch.clone()]).await;

        let action = sync
            .dispatch(timeout_action(), &targets(&["twitch"]), CancellationToken::new())
            .await;
        assert!(matches!(
            action.sync_results["twitch"],
            SyncOutcome::Failed { attempts: 1, .. }
        ));
        assert_eq!(twitch.call_count(), 1);
    }

    #[tokio::test]
    async fn test_kick_is_unsupported_by_default() {
        let twitch = MockAdapter::new("twitch");
        let sync = synchronizer(vec![twitch.clone()]).await;
        let mut action = timeout_action();
        action.enforcement = Enforcement::Kick;

        let action = sync.dispatch(action, &targets(&["twitch"]), CancellationToken::new()).await;
        assert!(matches!(action.sync_results["twitch"], SyncOutcome::Failed { .. }));
        assert_eq!(twitch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_hanging_adapter_times_out() {
        let slow = MockAdapter::hanging("twitch");
        let sync = synchronizer(vec![slow.clone()]).await;
        let action = sync
            .dispatch(timeout_action(), &targets(&["twitch"]), CancellationToken::new())
            .await;
        match &action.sync_results["twitch"] {
            SyncOutcome::Failed { attempts, error } => {
                assert_eq!(*attempts, 3);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_attempts() {
        let slow = MockAdapter::hanging("twitch");
        let sync = synchronizer(vec![slow.clone()]).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let action = sync.dispatch(timeout_action(), &targets(&["twitch"]), cancel).await;
        assert_eq!(action.sync_results["twitch"], SyncOutcome::Cancelled { attempts: 1 });
    }

    #[tokio::test]
    async fn test_shutdown_cancels_spawned_dispatch() {
        let slow = MockAdapter::hanging("twitch");
        let sync = synchronizer(vec![slow.clone()]).await;
        let handle = sync.spawn_dispatch(timeout_action(), targets(&["twitch"]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        sync.shutdown.cancel();

        let action = handle.await.unwrap();
        assert_eq!(action.sync_results["twitch"], SyncOutcome::Cancelled { attempts: 1 });
    }

    #[tokio::test]
    async fn test_spawned_delivery_records_results() {
        let twitch = MockAdapter::new("twitch");
        let sync = synchronizer(vec![twitch.clone()]).await;

        let prepared = sync.prepare(timeout_action(), &targets(&["twitch"])).await;
        assert_eq!(prepared.sync_results["twitch"], SyncOutcome::Pending);

        let done = sync.spawn_delivery(prepared).await.unwrap();
        assert_eq!(done.sync_results["twitch"], SyncOutcome::Applied { attempts: 1 });
        let stored = sync.db.audit().get_action(&done.id).await.unwrap();
        assert_eq!(stored.sync_results["twitch"], SyncOutcome::Applied { attempts: 1 });
    }
}
