use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::security::{BlockedWord, FilterAction};

/// Maximum characters of a message kept in the filter-match audit log.
pub const EXCERPT_MAX_CHARS: usize = 200;

/// Sanitize HTML in stored excerpts; the audit views are rendered by the
/// admin UI.
pub fn sanitize_excerpt(input: &str) -> String {
    let truncated: String = input.chars().take(EXCERPT_MAX_CHARS).collect();
    ammonia::Builder::default()
        .tags(std::collections::HashSet::new())
        .clean(&truncated)
        .to_string()
}

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    Manual,
    Spam,
    Filter,
    RateLimit,
}

impl WarningType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningType::Manual => "manual",
            WarningType::Spam => "spam",
            WarningType::Filter => "filter",
            WarningType::RateLimit => "rate_limit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(WarningType::Manual),
            "spam" => Some(WarningType::Spam),
            "filter" => Some(WarningType::Filter),
            "rate_limit" => Some(WarningType::RateLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningRecord {
    pub id: String,
    pub community_id: String,
    pub platform: String,
    pub platform_user_id: String,
    #[serde(rename = "type")]
    pub warning_type: WarningType,
    pub reason: String,
    /// `None` when issued by the system.
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub revoked_by: Option<String>,
    pub revoked_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    pub id: String,
    pub community_id: String,
    pub platform: String,
    pub platform_user_id: String,
    pub message_excerpt: String,
    pub matched_pattern: String,
    pub action: FilterAction,
    pub matched_at: DateTime<Utc>,
}

/// Enforcement a platform adapter is asked to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "snake_case")]
pub enum Enforcement {
    Warn,
    Timeout {
        #[serde(rename = "durationMinutes")]
        duration_minutes: u32,
    },
    Kick,
    Ban,
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::Warn => "warn",
            Enforcement::Timeout { .. } => "timeout",
            Enforcement::Kick => "kick",
            Enforcement::Ban => "ban",
        }
    }

    pub fn duration_minutes(&self) -> Option<u32> {
        match self {
            Enforcement::Timeout { duration_minutes } => Some(*duration_minutes),
            _ => None,
        }
    }

    pub fn from_parts(action_type: &str, duration_minutes: Option<u32>) -> Option<Self> {
        match (action_type, duration_minutes) {
            ("warn", _) => Some(Enforcement::Warn),
            ("timeout", Some(duration_minutes)) => Some(Enforcement::Timeout { duration_minutes }),
            ("kick", _) => Some(Enforcement::Kick),
            ("ban", _) => Some(Enforcement::Ban),
            _ => None,
        }
    }

    /// Ordering used to pick the stronger of two enforcements.
    pub fn severity(&self) -> (u8, u32) {
        match self {
            Enforcement::Warn => (0, 0),
            Enforcement::Timeout { duration_minutes } => (1, *duration_minutes),
            Enforcement::Kick => (2, 0),
            Enforcement::Ban => (3, 0),
        }
    }

    /// Reputation change reported for this enforcement.
    pub fn reputation_delta(&self) -> i32 {
        match self {
            Enforcement::Warn => -25,
            Enforcement::Timeout { .. } => -50,
            Enforcement::Kick => -75,
            Enforcement::Ban => -200,
        }
    }
}

/// Per-platform result of an action sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncOutcome {
    Pending,
    Applied { attempts: u32 },
    AlreadyApplied,
    Failed { attempts: u32, error: String },
    NoAdapter,
    Cancelled { attempts: u32 },
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Pending => "pending",
            SyncOutcome::Applied { .. } => "applied",
            SyncOutcome::AlreadyApplied => "already_applied",
            SyncOutcome::Failed { .. } => "failed",
            SyncOutcome::NoAdapter => "no_adapter",
            SyncOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationAction {
    pub id: String,
    pub community_id: String,
    pub platform: String,
    pub platform_user_id: String,
    #[serde(flatten)]
    pub enforcement: Enforcement,
    pub reason: String,
    /// `None` when decided by the system.
    pub moderator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sync_targets: Vec<String>,
    pub sync_results: BTreeMap<String, SyncOutcome>,
    pub idempotency_key: Option<String>,
}

impl ModerationAction {
    pub fn new(
        community_id: &str,
        platform: &str,
        platform_user_id: &str,
        enforcement: Enforcement,
        reason: String,
        moderator_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            platform: platform.to_string(),
            platform_user_id: platform_user_id.to_string(),
            enforcement,
            reason,
            moderator_id,
            created_at: Utc::now(),
            sync_targets: Vec::new(),
            sync_results: BTreeMap::new(),
            idempotency_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub is_command: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckMessageRequest {
    pub community_id: String,
    pub platform: String,
    pub platform_user_id: String,
    pub message: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl CheckMessageRequest {
    /// Commands are prefixed with `!` unless the caller says otherwise.
    pub fn is_command(&self) -> bool {
        self.metadata
            .is_command
            .unwrap_or_else(|| self.message.trim_start().starts_with('!'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited,
    SpamDetected,
    ContentFiltered,
}

/// Action reported back to the caller of `/check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTaken {
    Delete,
    Warn,
    Timeout {
        #[serde(rename = "durationMinutes")]
        duration_minutes: u32,
    },
    Kick,
    Ban,
}

impl From<Enforcement> for ActionTaken {
    fn from(enforcement: Enforcement) -> Self {
        match enforcement {
            Enforcement::Warn => ActionTaken::Warn,
            Enforcement::Timeout { duration_minutes } => ActionTaken::Timeout { duration_minutes },
            Enforcement::Kick => ActionTaken::Kick,
            Enforcement::Ban => ActionTaken::Ban,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckMessageResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<ActionTaken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl CheckMessageResponse {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            blocked_reason: None,
            action_taken: None,
            detail: None,
            retry_after_seconds: None,
        }
    }

    pub fn blocked(reason: BlockReason, detail: String) -> Self {
        Self {
            allowed: false,
            blocked_reason: Some(reason),
            action_taken: None,
            detail: Some(detail),
            retry_after_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PageQuery {
    pub const MAX_PER_PAGE: u32 = 200;

    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, Self::MAX_PER_PAGE) as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.limit()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, query: &PageQuery, total: i64) -> Self {
        Self {
            items,
            page: query.page.max(1),
            per_page: query.limit() as u32,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningStatus {
    #[default]
    Active,
    Expired,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningListQuery {
    #[serde(default)]
    pub status: WarningStatus,
    pub platform: Option<String>,
    pub platform_user_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

impl WarningListQuery {
    pub fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            per_page: self.per_page,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub platform: String,
    pub platform_user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueWarningRequest {
    pub platform: String,
    pub platform_user_id: String,
    pub reason: String,
    pub issued_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeWarningRequest {
    pub revoked_by: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddBlockedWordsRequest {
    pub words: Vec<BlockedWord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveBlockedWordsRequest {
    pub words: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActionRequest {
    pub community_id: String,
    pub platform: String,
    pub platform_user_id: String,
    #[serde(flatten)]
    pub enforcement: Enforcement,
    pub reason: String,
    pub moderator_id: Option<String>,
    /// Defaults to every registered platform.
    pub targets: Option<Vec<String>>,
}
