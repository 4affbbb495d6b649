use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::{Database, DbError};

/// Compiled regexes larger than this are rejected at config time.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Configuration rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("warningThresholdTimeout ({timeout}) must be lower than warningThresholdBan ({ban})")]
    ThresholdOrder { timeout: u32, ban: u32 },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("timeoutTiersMinutes must contain at least one non-zero duration")]
    EmptyTiers,

    #[error("blocked word must not be empty")]
    EmptyWord,

    #[error("invalid blocked pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("{0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// What to do with a message that hit a content filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    #[default]
    Warn,
    Timeout,
    Ban,
    /// Drop the message without touching the warning ledger.
    Delete,
}

impl FilterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterAction::Warn => "warn",
            FilterAction::Timeout => "timeout",
            FilterAction::Ban => "ban",
            FilterAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warn" => Some(FilterAction::Warn),
            "timeout" => Some(FilterAction::Timeout),
            "ban" => Some(FilterAction::Ban),
            "delete" => Some(FilterAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Match only as a complete token.
    #[default]
    Word,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedWordRule {
    pub word: String,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FilterAction>,
}

/// A blocked word, written either as a bare string or as a full rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockedWord {
    Plain(String),
    Rule(BlockedWordRule),
}

impl BlockedWord {
    pub fn rule(&self) -> BlockedWordRule {
        match self {
            BlockedWord::Plain(word) => BlockedWordRule {
                word: word.clone(),
                mode: MatchMode::Word,
                action: None,
            },
            BlockedWord::Rule(rule) => rule.clone(),
        }
    }

    pub fn word(&self) -> &str {
        match self {
            BlockedWord::Plain(word) => word,
            BlockedWord::Rule(rule) => &rule.word,
        }
    }

    fn key(&self) -> String {
        self.word().trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedPatternRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FilterAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockedPattern {
    Plain(String),
    Rule(BlockedPatternRule),
}

impl BlockedPattern {
    pub fn pattern(&self) -> &str {
        match self {
            BlockedPattern::Plain(pattern) => pattern,
            BlockedPattern::Rule(rule) => &rule.pattern,
        }
    }

    pub fn action(&self) -> Option<FilterAction> {
        match self {
            BlockedPattern::Plain(_) => None,
            BlockedPattern::Rule(rule) => rule.action,
        }
    }
}

/// Per-community security configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub spam_enabled: bool,
    pub spam_message_threshold: u32,
    pub spam_interval_seconds: u32,
    pub spam_duplicate_threshold: u32,
    pub content_filter_enabled: bool,
    pub blocked_words: Vec<BlockedWord>,
    pub blocked_patterns: Vec<BlockedPattern>,
    pub filter_action: FilterAction,
    pub warning_enabled: bool,
    pub warning_threshold_timeout: u32,
    pub warning_threshold_ban: u32,
    pub warning_decay_days: u32,
    pub rate_limit_messages_per_minute: u32,
    pub rate_limit_commands_per_minute: u32,
    pub auto_timeout_enabled: bool,
    pub timeout_tiers_minutes: Vec<u32>,
    pub cross_platform_sync: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            spam_enabled: true,
            spam_message_threshold: 5,
            spam_interval_seconds: 10,
            spam_duplicate_threshold: 3,
            content_filter_enabled: true,
            blocked_words: Vec::new(),
            blocked_patterns: Vec::new(),
            filter_action: FilterAction::Warn,
            warning_enabled: true,
            warning_threshold_timeout: 3,
            warning_threshold_ban: 5,
            warning_decay_days: 30,
            rate_limit_messages_per_minute: 20,
            rate_limit_commands_per_minute: 5,
            auto_timeout_enabled: true,
            timeout_tiers_minutes: vec![5, 60, 1440],
            cross_platform_sync: false,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.warning_threshold_timeout == 0 {
            return Err(ValidationError::Zero("warningThresholdTimeout"));
        }
        if self.warning_threshold_timeout >= self.warning_threshold_ban {
            return Err(ValidationError::ThresholdOrder {
                timeout: self.warning_threshold_timeout,
                ban: self.warning_threshold_ban,
            });
        }
        if self.warning_decay_days == 0 {
            return Err(ValidationError::Zero("warningDecayDays"));
        }
        if self.spam_interval_seconds == 0 {
            return Err(ValidationError::Zero("spamIntervalSeconds"));
        }
        if self.timeout_tiers_minutes.is_empty() || self.timeout_tiers_minutes.contains(&0) {
            return Err(ValidationError::EmptyTiers);
        }
        if self.blocked_words.iter().any(|w| w.word().trim().is_empty()) {
            return Err(ValidationError::EmptyWord);
        }
        for pattern in &self.blocked_patterns {
            RegexBuilder::new(pattern.pattern())
                .case_insensitive(true)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build()
                .map_err(|e| ValidationError::BadPattern {
                    pattern: pattern.pattern().to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Add words, replacing an existing entry for the same word.
    pub fn add_blocked_words(&mut self, words: Vec<BlockedWord>) {
        for word in words {
            let key = word.key();
            match self.blocked_words.iter_mut().find(|w| w.key() == key) {
                Some(existing) => *existing = word,
                None => self.blocked_words.push(word),
            }
        }
    }

    pub fn remove_blocked_words(&mut self, words: &[String]) {
        let keys: Vec<String> = words.iter().map(|w| w.trim().to_lowercase()).collect();
        self.blocked_words.retain(|w| !keys.contains(&w.key()));
    }
}

/// Partial update of a `SecurityConfig`; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub spam_enabled: Option<bool>,
    pub spam_message_threshold: Option<u32>,
    pub spam_interval_seconds: Option<u32>,
    pub spam_duplicate_threshold: Option<u32>,
    pub content_filter_enabled: Option<bool>,
    pub blocked_words: Option<Vec<BlockedWord>>,
    pub blocked_patterns: Option<Vec<BlockedPattern>>,
    pub filter_action: Option<FilterAction>,
    pub warning_enabled: Option<bool>,
    pub warning_threshold_timeout: Option<u32>,
    pub warning_threshold_ban: Option<u32>,
    pub warning_decay_days: Option<u32>,
    pub rate_limit_messages_per_minute: Option<u32>,
    pub rate_limit_commands_per_minute: Option<u32>,
    pub auto_timeout_enabled: Option<bool>,
    pub timeout_tiers_minutes: Option<Vec<u32>>,
    pub cross_platform_sync: Option<bool>,
}

macro_rules! merge_fields {
    ($base:ident, $patch:ident, $($field:ident),+ $(,)?) => {
        $( if let Some(value) = $patch.$field { $base.$field = value; } )+
    };
}

impl ConfigPatch {
    pub fn apply(self, mut base: SecurityConfig) -> SecurityConfig {
        let patch = self;
        merge_fields!(
            base,
            patch,
            spam_enabled,
            spam_message_threshold,
            spam_interval_seconds,
            spam_duplicate_threshold,
            content_filter_enabled,
            blocked_words,
            blocked_patterns,
            filter_action,
            warning_enabled,
            warning_threshold_timeout,
            warning_threshold_ban,
            warning_decay_days,
            rate_limit_messages_per_minute,
            rate_limit_commands_per_minute,
            auto_timeout_enabled,
            timeout_tiers_minutes,
            cross_platform_sync,
        );
        base
    }
}

/// Per-community configuration with an explicit in-memory cache.
///
/// Writes persist first and then invalidate the cached entry while holding
/// the cache write lock, so a reader can never repopulate the cache with the
/// value the write just replaced.
#[derive(Clone)]
pub struct ConfigStore {
    db: Database,
    cache: Arc<RwLock<HashMap<String, Arc<SecurityConfig>>>>,
}

impl ConfigStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Configuration for a community. Never fails: a missing or unreadable
    /// entry yields the built-in defaults.
    pub async fn get(&self, community_id: &str) -> Arc<SecurityConfig> {
        if let Some(config) = self.cache.read().await.get(community_id) {
            return config.clone();
        }

        let mut cache = self.cache.write().await;
        if let Some(config) = cache.get(community_id) {
            return config.clone();
        }

        match self.db.configs().load(community_id).await {
            Ok(Some(config)) => {
                let config = Arc::new(config);
                cache.insert(community_id.to_string(), config.clone());
                config
            }
            Ok(None) => {
                debug!(community_id, "no security config stored; using defaults");
                let config = Arc::new(SecurityConfig::default());
                cache.insert(community_id.to_string(), config.clone());
                config
            }
            Err(e) => {
                warn!(community_id, error = %e, "failed to load security config; using defaults");
                Arc::new(SecurityConfig::default())
            }
        }
    }

    /// Merge `patch` into the current configuration, validate and persist it.
    pub async fn put(&self, community_id: &str, patch: ConfigPatch) -> Result<Arc<SecurityConfig>, ConfigError> {
        self.update(community_id, |config| {
            *config = patch.apply(config.clone());
        })
        .await
    }

    pub async fn add_blocked_words(
        &self,
        community_id: &str,
        words: Vec<BlockedWord>,
    ) -> Result<Arc<SecurityConfig>, ConfigError> {
        self.update(community_id, |config| config.add_blocked_words(words)).await
    }

    pub async fn remove_blocked_words(
        &self,
        community_id: &str,
        words: &[String],
    ) -> Result<Arc<SecurityConfig>, ConfigError> {
        self.update(community_id, |config| config.remove_blocked_words(words)).await
    }

    async fn update(
        &self,
        community_id: &str,
        change: impl FnOnce(&mut SecurityConfig),
    ) -> Result<Arc<SecurityConfig>, ConfigError> {
        let mut cache = self.cache.write().await;

        let mut config = match cache.get(community_id) {
            Some(current) => (**current).clone(),
            None => self.db.configs().load(community_id).await?.unwrap_or_default(),
        };
        change(&mut config);
        config.validate()?;

        self.db.configs().save(community_id, &config).await?;
        cache.remove(community_id);

        info!(community_id, "security config updated");
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ConfigStore {
        ConfigStore::new(Database::new(":memory:").await.unwrap())
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SecurityConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_order_rejected() {
        let config = SecurityConfig {
            warning_threshold_timeout: 5,
            warning_threshold_ban: 5,
            ..SecurityConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::ThresholdOrder { timeout: 5, ban: 5 })
        );
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = SecurityConfig {
            blocked_patterns: vec![BlockedPattern::Plain("(unclosed".into())],
            ..SecurityConfig::default()
        };
        assert!(matches!(config.validate(), Err(ValidationError::BadPattern { .. })));
    }

    #[test]
    fn test_blocked_words_accept_plain_and_rule_forms() {
        let words: Vec<BlockedWord> = serde_json::from_str(
            r#"["scam", {"word": "ass", "mode": "word", "action": "timeout"}, {"word": "spam"}]"#,
        )
        .unwrap();
        assert_eq!(words[0], BlockedWord::Plain("scam".into()));
        assert_eq!(words[1].rule().action, Some(FilterAction::Timeout));
        assert_eq!(words[2].rule().mode, MatchMode::Word);
    }

    #[test]
    fn test_add_blocked_words_replaces_same_word() {
        let mut config = SecurityConfig::default();
        config.add_blocked_words(vec![BlockedWord::Plain("Scam".into())]);
        config.add_blocked_words(vec![BlockedWord::Rule(BlockedWordRule {
            word: "scam".into(),
            mode: MatchMode::Substring,
            action: None,
        })]);
        assert_eq!(config.blocked_words.len(), 1);
        assert_eq!(config.blocked_words[0].rule().mode, MatchMode::Substring);

        config.remove_blocked_words(&["SCAM".to_string()]);
        assert!(config.blocked_words.is_empty());
    }

    #[tokio::test]
    async fn test_get_without_config_returns_defaults() {
        let store = store().await;
        assert_eq!(*store.get("community-1").await, SecurityConfig::default());
    }

    #[tokio::test]
    async fn test_put_then_get_observes_new_value() {
        let store = store().await;
        let before = store.get("c1").await;
        assert_eq!(before.spam_message_threshold, 5);

        let patch = ConfigPatch {
            spam_message_threshold: Some(8),
            blocked_words: Some(vec![BlockedWord::Plain("scam".into())]),
            filter_action: Some(FilterAction::Delete),
            ..ConfigPatch::default()
        };
        let written = store.put("c1", patch).await.unwrap();

        let after = store.get("c1").await;
        assert_eq!(*after, *written);
        assert_eq!(after.spam_message_threshold, 8);
        assert_eq!(after.filter_action, FilterAction::Delete);
        assert_ne!(*after, *before);
    }

    #[tokio::test]
    async fn test_put_persists_across_store_instances() {
        let db = Database::new(":memory:").await.unwrap();
        let first = ConfigStore::new(db.clone());
        first
            .put("c1", ConfigPatch { cross_platform_sync: Some(true), ..ConfigPatch::default() })
            .await
            .unwrap();

        let second = ConfigStore::new(db);
        assert!(second.get("c1").await.cross_platform_sync);
    }

    #[tokio::test]
    async fn test_invalid_put_keeps_previous_value() {
        let store = store().await;
        let err = store
            .put(
                "c1",
                ConfigPatch {
                    warning_threshold_timeout: Some(6),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ValidationError::ThresholdOrder { .. })));
        assert_eq!(store.get("c1").await.warning_threshold_timeout, 3);
    }
}
