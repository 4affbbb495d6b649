use chrono::Utc;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{sanitize_excerpt, FilterMatch};
use crate::security::{FilterAction, MatchMode, SecurityConfig};

/// A rule that matched a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterHit {
    pub pattern: String,
    pub action: FilterAction,
}

enum Matcher {
    /// Lowercased needle.
    Substring(String),
    Regex(Regex),
}

struct CompiledRule {
    label: String,
    matcher: Matcher,
    action: Option<FilterAction>,
}

impl CompiledRule {
    fn is_match(&self, message: &str, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(needle) => lowered.contains(needle.as_str()),
            Matcher::Regex(regex) => regex.is_match(message),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-token matcher; boundaries are only required on sides that start
/// or end with a word character, so entries like "c++" still match.
fn word_regex(word: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::new();
    if word.chars().next().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(word));
    if word.chars().last().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

/// Compile words first, then patterns, both in declaration order.
fn compile(config: &SecurityConfig) -> Vec<CompiledRule> {
    let mut rules = Vec::with_capacity(config.blocked_words.len() + config.blocked_patterns.len());

    for word in &config.blocked_words {
        let rule = word.rule();
        let word = rule.word.trim();
        if word.is_empty() {
            continue;
        }
        let matcher = match rule.mode {
            MatchMode::Substring => Matcher::Substring(word.to_lowercase()),
            MatchMode::Word => match word_regex(word) {
                Ok(regex) => Matcher::Regex(regex),
                Err(e) => {
                    warn!(word, error = %e, "skipping blocked word");
                    continue;
                }
            },
        };
        rules.push(CompiledRule {
            label: word.to_string(),
            matcher,
            action: rule.action,
        });
    }

    for pattern in &config.blocked_patterns {
        match RegexBuilder::new(pattern.pattern()).case_insensitive(true).build() {
            Ok(regex) => rules.push(CompiledRule {
                label: pattern.pattern().to_string(),
                matcher: Matcher::Regex(regex),
                action: pattern.action(),
            }),
            Err(e) => warn!(pattern = pattern.pattern(), error = %e, "skipping blocked pattern"),
        }
    }

    rules
}

type RuleCache = HashMap<String, (Arc<SecurityConfig>, Arc<Vec<CompiledRule>>)>;

/// Blocked-word and pattern matching with per-community compiled rules.
///
/// Compiled rules are keyed by the config `Arc` they were built from, so a
/// config update in `ConfigStore` is picked up on the next check.
#[derive(Clone)]
pub struct ContentFilter {
    db: Database,
    rules: Arc<RwLock<RuleCache>>,
}

impl ContentFilter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            rules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn rules_for(&self, community_id: &str, config: &Arc<SecurityConfig>) -> Arc<Vec<CompiledRule>> {
        {
            let cache = self.rules.read().unwrap_or_else(|e| e.into_inner());
            if let Some((source, rules)) = cache.get(community_id) {
                if Arc::ptr_eq(source, config) {
                    return rules.clone();
                }
            }
        }

        let rules = Arc::new(compile(config));
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(community_id.to_string(), (config.clone(), rules.clone()));
        rules
    }

    /// First matching rule, without side effects.
    pub fn find_match(
        &self,
        community_id: &str,
        message: &str,
        config: &Arc<SecurityConfig>,
    ) -> Option<FilterHit> {
        if !config.content_filter_enabled {
            return None;
        }
        let lowered = message.to_lowercase();
        self.rules_for(community_id, config)
            .iter()
            .find(|rule| rule.is_match(message, &lowered))
            .map(|rule| FilterHit {
                pattern: rule.label.clone(),
                action: rule.action.unwrap_or(config.filter_action),
            })
    }

    /// Match a message and persist a `FilterMatch` audit row for any hit.
    /// A failed audit write is logged and does not change the verdict.
    pub async fn check(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        message: &str,
        config: &Arc<SecurityConfig>,
    ) -> Option<FilterHit> {
        let hit = self.find_match(community_id, message, config)?;
        debug!(community_id, pattern = %hit.pattern, action = hit.action.as_str(), "content filter hit");
        metrics::counter!("filter_matches_total", 1);

        let record = FilterMatch {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            platform: platform.to_string(),
            platform_user_id: user_id.to_string(),
            message_excerpt: sanitize_excerpt(message),
            matched_pattern: hit.pattern.clone(),
            action: hit.action,
            matched_at: Utc::now(),
        };
        if let Err(e) = self.db.audit().insert_filter_match(&record).await {
            warn!(community_id, error = %e, "failed to persist filter match");
        }

        Some(hit)
    }
}
