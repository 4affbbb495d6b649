//! Ephemeral counter store used by the rate limiter, spam detector and the
//! sync dedup markers.
//!
//! Keys always carry a TTL. Redis is the shared deployment backend
//! (see `redis_client.rs`); `MemoryStore` keeps the same semantics inside a
//! single process.

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ephemeral store unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected ephemeral store reply: {0}")]
    Protocol(String),
}

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    /// Seconds until the window resets.
    pub ttl_secs: i64,
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Atomically increment `key`. The first increment of a window sets the
    /// expiry to `window_secs`; later increments leave it alone.
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError>;

    /// Push `entry` to the front of the list at `key`, trim it to `cap`
    /// entries, refresh its TTL and return the list newest-first.
    async fn push_recent(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl_secs: u64,
    ) -> Result<Vec<String>, StoreError>;

    /// Set a marker key that expires after `ttl_secs`.
    async fn mark(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> bool;
}

enum SlotValue {
    Counter(i64),
    List(VecDeque<String>),
    Marker,
}

struct Slot {
    value: SlotValue,
    expires_at: Instant,
}

impl Slot {
    fn new(value: SlotValue, expires_at: Instant) -> Self {
        Self { value, expires_at }
    }
}

/// Operations between two sweeps of expired slots.
const PRUNE_EVERY: u64 = 1024;

/// In-process store with TTL semantics matching the Redis scripts.
///
/// Expiry is checked on the touched key; a full sweep runs every
/// `PRUNE_EVERY` operations so idle keys do not pile up.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    ops: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self, now: Instant) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }
    }

    fn prune(&self, now: Instant) {
        self.slots.retain(|_, slot| slot.expires_at > now);
    }

    /// Live slot for `key`, replacing an expired one with `fresh()`.
    fn live_slot(&self, key: &str, now: Instant, fresh: impl Fn() -> Slot) -> RefMut<'_, String, Slot> {
        self.tick(now);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(&fresh);
        if slot.expires_at <= now {
            *slot = fresh();
        }
        slot
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let mut slot = self.live_slot(key, now, || {
            Slot::new(SlotValue::Counter(0), now + Duration::from_secs(window_secs))
        });
        let ttl = slot.expires_at.saturating_duration_since(now);
        match &mut slot.value {
            SlotValue::Counter(count) => {
                *count += 1;
                Ok(WindowCount {
                    count: *count,
                    ttl_secs: ttl.as_secs_f64().ceil() as i64,
                })
            }
            _ => Err(StoreError::Protocol(format!("{key} is not a counter"))),
        }
    }

    async fn push_recent(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl_secs: u64,
    ) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut slot = self.live_slot(key, now, || Slot::new(SlotValue::List(VecDeque::new()), now));
        slot.expires_at = now + Duration::from_secs(ttl_secs);
        match &mut slot.value {
            SlotValue::List(items) => {
                items.push_front(entry.to_string());
                items.truncate(cap.max(1));
                Ok(items.iter().cloned().collect())
            }
            _ => Err(StoreError::Protocol(format!("{key} is not a list"))),
        }
    }

    async fn mark(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        self.tick(now);
        self.slots.insert(
            key.to_string(),
            Slot::new(SlotValue::Marker, now + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.tick(now);
        Ok(self.slots.get(key).is_some_and(|slot| slot.expires_at > now))
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Store that is always unreachable, for fail-open tests.
#[cfg(test)]
pub struct DownStore;

#[cfg(test)]
#[async_trait]
impl EphemeralStore for DownStore {
    async fn incr_window(&self, _: &str, _: u64) -> Result<WindowCount, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn push_recent(&self, _: &str, _: &str, _: usize, _: u64) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn mark(&self, _: &str, _: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn ping(&self) -> bool {
        false
    }
}
