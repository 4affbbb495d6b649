//! Append-only warning ledger and the escalation state machine.
//!
//! ```text
//!   clean ──warn──▶ warned(n) ──n ≥ timeout──▶ escalating ──n ≥ ban──▶ banned
//!     ▲                 │                          │
//!     └──── decay / revoke lowers n on the next evaluation ────┘
//! ```
//!
//! Decay is applied at read time: a warning counts while it is active and
//! its `expires_at` lies in the future. Nothing sweeps expired rows.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::db::{Database, DbError, WarningFilter};
use crate::models::{Enforcement, WarningRecord, WarningType};
use crate::security::SecurityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Clean,
    Warned,
    Escalating,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationTier {
    None,
    Timeout { duration_minutes: u32 },
    Ban,
}

impl EscalationTier {
    /// Tier for `active` warnings under `config`.
    pub fn for_count(active: u32, config: &SecurityConfig) -> Self {
        if active >= config.warning_threshold_ban {
            return EscalationTier::Ban;
        }
        if active < config.warning_threshold_timeout {
            return EscalationTier::None;
        }
        let tiers = &config.timeout_tiers_minutes;
        let Some(last) = tiers.len().checked_sub(1) else {
            return EscalationTier::None;
        };
        let index = ((active - config.warning_threshold_timeout) as usize).min(last);
        EscalationTier::Timeout {
            duration_minutes: tiers[index],
        }
    }

    pub fn enforcement(&self) -> Option<Enforcement> {
        match self {
            EscalationTier::None => None,
            EscalationTier::Timeout { duration_minutes } => Some(Enforcement::Timeout {
                duration_minutes: *duration_minutes,
            }),
            EscalationTier::Ban => Some(Enforcement::Ban),
        }
    }
}

impl EscalationState {
    pub fn for_count(active: u32, config: &SecurityConfig) -> Self {
        if active == 0 {
            EscalationState::Clean
        } else if active >= config.warning_threshold_ban {
            EscalationState::Banned
        } else if active >= config.warning_threshold_timeout {
            EscalationState::Escalating
        } else {
            EscalationState::Warned
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub active_count: u32,
    pub state: EscalationState,
    #[serde(skip)]
    pub tier: EscalationTier,
}

#[derive(Clone)]
pub struct WarningLedger {
    db: Database,
}

impl WarningLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_violation(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        warning_type: WarningType,
        reason: &str,
        issued_by: Option<&str>,
        config: &SecurityConfig,
    ) -> Result<WarningRecord, DbError> {
        self.record_violation_at(
            community_id,
            platform,
            user_id,
            warning_type,
            reason,
            issued_by,
            config,
            Utc::now(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_violation_at(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        warning_type: WarningType,
        reason: &str,
        issued_by: Option<&str>,
        config: &SecurityConfig,
        now: DateTime<Utc>,
    ) -> Result<WarningRecord, DbError> {
        let warning = WarningRecord {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            platform: platform.to_string(),
            platform_user_id: user_id.to_string(),
            warning_type,
            reason: reason.to_string(),
            issued_by: issued_by.map(str::to_string),
            issued_at: now,
            expires_at: now + Duration::days(i64::from(config.warning_decay_days)),
            is_active: true,
            revoked_by: None,
            revoked_reason: None,
            revoked_at: None,
        };
        self.db.warnings().insert(&warning).await?;

        metrics::counter!("warnings_issued_total", 1, "type" => warning_type.as_str());
        info!(
            community_id,
            platform,
            user_id,
            warning_type = warning_type.as_str(),
            "warning recorded"
        );
        Ok(warning)
    }

    pub async fn active_count(&self, community_id: &str, platform: &str, user_id: &str) -> Result<u32, DbError> {
        self.active_count_at(community_id, platform, user_id, Utc::now()).await
    }

    pub async fn active_count_at(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, DbError> {
        self.db
            .warnings()
            .count_active(community_id, platform, user_id, now)
            .await
    }

    /// Recount active warnings and derive the tier to enforce. Calling it
    /// again without new violations never raises the tier.
    pub async fn evaluate(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        config: &SecurityConfig,
    ) -> Result<Evaluation, DbError> {
        self.evaluate_at(community_id, platform, user_id, config, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        config: &SecurityConfig,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, DbError> {
        let active_count = self.active_count_at(community_id, platform, user_id, now).await?;
        Ok(Evaluation {
            active_count,
            state: EscalationState::for_count(active_count, config),
            tier: EscalationTier::for_count(active_count, config),
        })
    }

    /// Deactivate a warning. Actions already taken are not undone.
    pub async fn revoke_warning(
        &self,
        community_id: &str,
        id: &str,
        revoked_by: &str,
        reason: &str,
    ) -> Result<WarningRecord, DbError> {
        let warning = self
            .db
            .warnings()
            .revoke(community_id, id, revoked_by, reason, Utc::now())
            .await?;
        info!(community_id, warning_id = id, revoked_by, "warning revoked");
        Ok(warning)
    }

    pub async fn list(
        &self,
        community_id: &str,
        filter: &WarningFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WarningRecord>, i64), DbError> {
        self.db
            .warnings()
            .list(community_id, filter, Utc::now(), limit, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WarningStatus;

    async fn ledger() -> WarningLedger {
        WarningLedger::new(Database::new(":memory:").await.unwrap())
    }

    fn config() -> SecurityConfig {
        SecurityConfig {
            warning_threshold_timeout: 3,
            warning_threshold_ban: 5,
            timeout_tiers_minutes: vec![5, 60, 1440],
            warning_decay_days: 30,
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn test_tiers_escalate_then_ban() {
        let config = config();
        assert_eq!(EscalationTier::for_count(0, &config), EscalationTier::None);
        assert_eq!(EscalationTier::for_count(2, &config), EscalationTier::None);
        assert_eq!(
            EscalationTier::for_count(3, &config),
            EscalationTier::Timeout { duration_minutes: 5 }
        );
        assert_eq!(
            EscalationTier::for_count(4, &config),
            EscalationTier::Timeout { duration_minutes: 60 }
        );
        assert_eq!(EscalationTier::for_count(5, &config), EscalationTier::Ban);
    }

    #[test]
    fn test_timeout_index_caps_at_last_tier() {
        let config = SecurityConfig {
            warning_threshold_timeout: 1,
            warning_threshold_ban: 10,
            timeout_tiers_minutes: vec![5, 60],
            ..SecurityConfig::default()
        };
        assert_eq!(
            EscalationTier::for_count(9, &config),
            EscalationTier::Timeout { duration_minutes: 60 }
        );
    }

    #[test]
    fn test_states() {
        let config = config();
        assert_eq!(EscalationState::for_count(0, &config), EscalationState::Clean);
        assert_eq!(EscalationState::for_count(1, &config), EscalationState::Warned);
        assert_eq!(EscalationState::for_count(3, &config), EscalationState::Escalating);
        assert_eq!(EscalationState::for_count(7, &config), EscalationState::Banned);
    }

    #[tokio::test]
    async fn test_record_and_evaluate() {
        let ledger = ledger().await;
        let config = config();
        let mut tiers = Vec::new();
        for _ in 0..5 {
            ledger
                .record_violation("c1", "twitch", "u1", WarningType::Spam, "burst", None, &config)
                .await
                .unwrap();
            tiers.push(ledger.evaluate("c1", "twitch", "u1", &config).await.unwrap().tier);
        }
        assert_eq!(
            tiers,
            vec![
                EscalationTier::None,
                EscalationTier::None,
                EscalationTier::Timeout { duration_minutes: 5 },
                EscalationTier::Timeout { duration_minutes: 60 },
                EscalationTier::Ban,
            ]
        );
    }

    #[tokio::test]
    async fn test_decayed_warnings_are_not_counted() {
        let ledger = ledger().await;
        let config = config();
        let now = Utc::now();
        let long_ago = now - Duration::days(31);
        for _ in 0..3 {
            ledger
                .record_violation_at("c1", "twitch", "u1", WarningType::Filter, "word", None, &config, long_ago)
                .await
                .unwrap();
        }
        ledger
            .record_violation_at("c1", "twitch", "u1", WarningType::Filter, "word", None, &config, now)
            .await
            .unwrap();

        let evaluation = ledger.evaluate_at("c1", "twitch", "u1", &config, now).await.unwrap();
        assert_eq!(evaluation.active_count, 1);
        assert_eq!(evaluation.tier, EscalationTier::None);
        assert_eq!(evaluation.state, EscalationState::Warned);

        let again = ledger.evaluate_at("c1", "twitch", "u1", &config, now).await.unwrap();
        assert_eq!(again, evaluation);
    }

    #[tokio::test]
    async fn test_decay_deescalates_over_time() {
        let ledger = ledger().await;
        let config = config();
        let start = Utc::now();
        for _ in 0..3 {
            ledger
                .record_violation_at("c1", "twitch", "u1", WarningType::Spam, "burst", None, &config, start)
                .await
                .unwrap();
        }
        let at_start = ledger.evaluate_at("c1", "twitch", "u1", &config, start).await.unwrap();
        assert_eq!(at_start.tier, EscalationTier::Timeout { duration_minutes: 5 });

        let later = start + Duration::days(30);
        let decayed = ledger.evaluate_at("c1", "twitch", "u1", &config, later).await.unwrap();
        assert_eq!(decayed.active_count, 0);
        assert_eq!(decayed.state, EscalationState::Clean);
    }

    #[tokio::test]
    async fn test_revoke_deescalates_immediately() {
        let ledger = ledger().await;
        let config = config();
        let mut last = None;
        for _ in 0..3 {
            last = Some(
                ledger
                    .record_violation("c1", "twitch", "u1", WarningType::Manual, "rude", Some("mod1"), &config)
                    .await
                    .unwrap(),
            );
        }
        let warning = last.unwrap();
        assert_eq!(warning.issued_by.as_deref(), Some("mod1"));

        let revoked = ledger.revoke_warning("c1", &warning.id, "mod2", "appeal").await.unwrap();
        assert!(!revoked.is_active);
        assert_eq!(revoked.revoked_by.as_deref(), Some("mod2"));
        assert_eq!(revoked.revoked_reason.as_deref(), Some("appeal"));

        let evaluation = ledger.evaluate("c1", "twitch", "u1", &config).await.unwrap();
        assert_eq!(evaluation.active_count, 2);
        assert_eq!(evaluation.tier, EscalationTier::None);
    }

    #[tokio::test]
    async fn test_revoke_unknown_warning_is_not_found() {
        let ledger = ledger().await;
        let err = ledger.revoke_warning("c1", "missing", "mod", "x").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_users_and_communities_are_separate() {
        let ledger = ledger().await;
        let config = config();
        ledger
            .record_violation("c1", "twitch", "u1", WarningType::Spam, "x", None, &config)
            .await
            .unwrap();
        assert_eq!(ledger.active_count("c1", "twitch", "u2").await.unwrap(), 0);
        assert_eq!(ledger.active_count("c2", "twitch", "u1").await.unwrap(), 0);
        assert_eq!(ledger.active_count("c1", "discord", "u1").await.unwrap(), 0);
        assert_eq!(ledger.active_count("c1", "twitch", "u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let ledger = ledger().await;
        let config = config();
        let old = Utc::now() - Duration::days(40);
        ledger
            .record_violation_at("c1", "twitch", "u1", WarningType::Spam, "old", None, &config, old)
            .await
            .unwrap();
        ledger
            .record_violation("c1", "twitch", "u1", WarningType::Spam, "new", None, &config)
            .await
            .unwrap();

        let active = WarningFilter { status: WarningStatus::Active, ..WarningFilter::default() };
        let expired = WarningFilter { status: WarningStatus::Expired, ..WarningFilter::default() };
        let all = WarningFilter { status: WarningStatus::All, ..WarningFilter::default() };

        let (items, total) = ledger.list("c1", &active, 10, 0).await.unwrap();
        assert_eq!((items[0].reason.as_str(), total), ("new", 1));
        let (items, total) = ledger.list("c1", &expired, 10, 0).await.unwrap();
        assert_eq!((items[0].reason.as_str(), total), ("old", 1));
        let (_, total) = ledger.list("c1", &all, 10, 0).await.unwrap();
        assert_eq!(total, 2);
    }
}
