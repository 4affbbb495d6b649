pub mod action_sync;
pub mod config_store;
pub mod content_filter;
pub mod gatekeeper;
pub mod middleware;
pub mod platforms;
pub mod rate_limiter;
pub mod spam_detector;
pub mod warning_ledger;

pub use action_sync::{ActionSynchronizer, AdapterRegistry, RetryPolicy};
pub use config_store::{
    BlockedWord, ConfigError, ConfigPatch, ConfigStore, FilterAction, MatchMode, SecurityConfig,
    ValidationError,
};
pub use content_filter::ContentFilter;
pub use gatekeeper::Gatekeeper;
pub use platforms::{HttpPlatformAdapter, HttpReputationSink, ReputationSink};
pub use rate_limiter::RateLimiter;
pub use spam_detector::SpamDetector;
pub use warning_ledger::{EscalationState, WarningLedger};
