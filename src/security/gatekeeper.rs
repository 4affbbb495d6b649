//! Message-checking pipeline.
//!
//! Checks run in a fixed order (rate limit, spam, content filter) and stop at
//! the first violation. The verdict is decided before any enforcement side
//! effect: ledger writes may fail and platform syncs run in the background,
//! neither changes what the caller is told.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::action_sync::ActionSynchronizer;
use super::content_filter::{ContentFilter, FilterHit};
use super::platforms::{ReputationEvent, ReputationSink};
use super::rate_limiter::{RateLimitScope, RateLimiter};
use super::spam_detector::{SpamDetector, SpamReason};
use super::warning_ledger::{Evaluation, WarningLedger};
use super::{ConfigStore, FilterAction, SecurityConfig, ValidationError};
use crate::db::DbError;
use crate::models::{
    ActionTaken, BlockReason, CheckMessageRequest, CheckMessageResponse, Enforcement, ModerationAction,
    SyncActionRequest, WarningRecord, WarningType,
};

const RATE_WINDOW_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Violation {
    RateLimited {
        scope: RateLimitScope,
        retry_after: Duration,
        first_denial: bool,
    },
    Spam {
        reason: SpamReason,
        first_detection: bool,
    },
    Filtered(FilterHit),
}

impl Violation {
    fn block_reason(&self) -> BlockReason {
        match self {
            Violation::RateLimited { .. } => BlockReason::RateLimited,
            Violation::Spam { .. } => BlockReason::SpamDetected,
            Violation::Filtered(_) => BlockReason::ContentFiltered,
        }
    }

    fn warning_type(&self) -> WarningType {
        match self {
            Violation::RateLimited { .. } => WarningType::RateLimit,
            Violation::Spam { .. } => WarningType::Spam,
            Violation::Filtered(_) => WarningType::Filter,
        }
    }

    fn detail(&self) -> String {
        match self {
            Violation::RateLimited { scope, .. } => format!("{} rate limit exceeded", scope.as_str()),
            Violation::Spam { reason, .. } => match reason {
                SpamReason::Burst { count } => format!("{}: {count} messages in interval", reason.code()),
                SpamReason::Duplicate { count } => format!("{}: {count} repeated messages", reason.code()),
            },
            Violation::Filtered(hit) => format!("matched {}", hit.pattern),
        }
    }

    /// Whether the violation feeds the warning ledger. Only the first denial
    /// of a rate window or the first spam detection of an interval counts,
    /// so a flood is one warning and not dozens.
    fn escalates(&self) -> bool {
        match self {
            Violation::RateLimited { first_denial, .. } => *first_denial,
            Violation::Spam { first_detection, .. } => *first_detection,
            Violation::Filtered(hit) => hit.action != FilterAction::Delete,
        }
    }

    /// Minimum enforcement demanded by a filter rule.
    fn floor(&self, config: &SecurityConfig) -> Option<Enforcement> {
        let Violation::Filtered(hit) = self else {
            return None;
        };
        match hit.action {
            FilterAction::Timeout => config
                .timeout_tiers_minutes
                .first()
                .map(|&duration_minutes| Enforcement::Timeout { duration_minutes }),
            FilterAction::Ban => Some(Enforcement::Ban),
            FilterAction::Warn | FilterAction::Delete => None,
        }
    }
}

fn stronger(current: Option<Enforcement>, other: Option<Enforcement>) -> Option<Enforcement> {
    match (current, other) {
        (Some(a), Some(b)) => Some(if b.severity() > a.severity() { b } else { a }),
        (a, b) => a.or(b),
    }
}

pub fn validate_check(request: &CheckMessageRequest) -> Result<(), ValidationError> {
    for (field, value) in [
        ("communityId", &request.community_id),
        ("platform", &request.platform),
        ("platformUserId", &request.platform_user_id),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::Request(format!("{field} is required")));
        }
    }
    Ok(())
}

/// Result of a manually issued warning.
#[derive(Debug, Clone)]
pub struct IssuedWarning {
    pub warning: WarningRecord,
    pub evaluation: Evaluation,
    pub enforcement: Enforcement,
}

#[derive(Clone)]
pub struct Gatekeeper {
    configs: ConfigStore,
    rate_limiter: RateLimiter,
    spam: SpamDetector,
    filter: ContentFilter,
    ledger: WarningLedger,
    sync: ActionSynchronizer,
    reputation: Option<Arc<dyn ReputationSink>>,
}

impl Gatekeeper {
    pub fn new(
        configs: ConfigStore,
        rate_limiter: RateLimiter,
        spam: SpamDetector,
        filter: ContentFilter,
        ledger: WarningLedger,
        sync: ActionSynchronizer,
        reputation: Option<Arc<dyn ReputationSink>>,
    ) -> Self {
        Self {
            configs,
            rate_limiter,
            spam,
            filter,
            ledger,
            sync,
            reputation,
        }
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn ledger(&self) -> &WarningLedger {
        &self.ledger
    }

    pub async fn check_message(&self, request: &CheckMessageRequest) -> CheckMessageResponse {
        let config = self.configs.get(&request.community_id).await;

        let Some(violation) = self.detect(request, &config).await else {
            metrics::counter!("gatekeeper_checks_total", 1, "outcome" => "allowed");
            return CheckMessageResponse::allowed();
        };

        let reason = violation.block_reason();
        metrics::counter!("gatekeeper_checks_total", 1, "outcome" => reason_label(reason));
        debug!(
            community_id = %request.community_id,
            user_id = %request.platform_user_id,
            reason = reason_label(reason),
            "message blocked"
        );

        let mut response = CheckMessageResponse::blocked(reason, violation.detail());
        if let Violation::RateLimited { retry_after, .. } = &violation {
            response.retry_after_seconds = Some(retry_after.as_secs().max(1));
        }
        response.action_taken = Some(self.enforce(request, &config, &violation).await);
        response
    }

    async fn detect(&self, request: &CheckMessageRequest, config: &Arc<SecurityConfig>) -> Option<Violation> {
        let (community, platform, user) = (
            request.community_id.as_str(),
            request.platform.as_str(),
            request.platform_user_id.as_str(),
        );

        let mut scopes = vec![(RateLimitScope::Message, config.rate_limit_messages_per_minute)];
        if request.is_command() {
            scopes.push((RateLimitScope::Command, config.rate_limit_commands_per_minute));
        }
        for (scope, limit) in scopes {
            let result = self
                .rate_limiter
                .allow(community, platform, user, scope, limit, RATE_WINDOW_SECONDS)
                .await;
            if !result.allowed {
                return Some(Violation::RateLimited {
                    scope,
                    retry_after: result.retry_after,
                    first_denial: result.first_denial,
                });
            }
        }

        let verdict = self.spam.check(community, platform, user, &request.message, config).await;
        if let Some(reason) = verdict.reason {
            return Some(Violation::Spam {
                reason,
                first_detection: verdict.first_detection,
            });
        }

        self.filter
            .check(community, platform, user, &request.message, config)
            .await
            .map(Violation::Filtered)
    }

    /// Record the violation, pick the enforcement and hand it to the
    /// synchronizer. Ledger failures fall back to the filter floor.
    async fn enforce(
        &self,
        request: &CheckMessageRequest,
        config: &SecurityConfig,
        violation: &Violation,
    ) -> ActionTaken {
        let mut enforcement = None;

        if config.warning_enabled && violation.escalates() {
            match self
                .ledger
                .record_violation(
                    &request.community_id,
                    &request.platform,
                    &request.platform_user_id,
                    violation.warning_type(),
                    &violation.detail(),
                    None,
                    config,
                )
                .await
            {
                Ok(_) => {
                    enforcement = Some(Enforcement::Warn);
                    match self
                        .ledger
                        .evaluate(&request.community_id, &request.platform, &request.platform_user_id, config)
                        .await
                    {
                        Ok(evaluation) => enforcement = stronger(enforcement, evaluation.tier.enforcement()),
                        Err(e) => warn!(community_id = %request.community_id, error = %e, "escalation evaluation failed"),
                    }
                }
                Err(e) => warn!(community_id = %request.community_id, error = %e, "failed to record warning"),
            }
        }

        enforcement = stronger(enforcement, violation.floor(config));
        let Some(mut enforcement) = enforcement else {
            return ActionTaken::Delete;
        };
        if !config.auto_timeout_enabled && matches!(enforcement, Enforcement::Timeout { .. }) {
            enforcement = Enforcement::Warn;
        }

        let action = ModerationAction::new(
            &request.community_id,
            &request.platform,
            &request.platform_user_id,
            enforcement,
            violation.detail(),
            None,
        );
        self.launch(action, config);
        ActionTaken::from(enforcement)
    }

    fn targets(&self, origin: &str, config: &SecurityConfig) -> Vec<String> {
        let mut targets = vec![origin.to_string()];
        if config.cross_platform_sync {
            targets.extend(self.sync.platforms().into_iter().filter(|p| p != origin));
        }
        targets
    }

    /// Spawn the sync and the reputation report for `action`.
    fn launch(&self, action: ModerationAction, config: &SecurityConfig) {
        self.report_reputation(&action);
        let targets = self.targets(&action.platform, config);
        self.sync.spawn_dispatch(action, targets);
    }

    fn report_reputation(&self, action: &ModerationAction) {
        let Some(sink) = self.reputation.clone() else {
            return;
        };
        let event = ReputationEvent {
            community_id: action.community_id.clone(),
            platform: action.platform.clone(),
            user_id: action.platform_user_id.clone(),
            delta: action.enforcement.reputation_delta(),
            reason: action.enforcement.as_str().to_string(),
        };
        tokio::spawn(async move { sink.report(event).await });
    }

    /// Record a moderator's warning and enforce whatever tier it reaches.
    pub async fn issue_manual_warning(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        reason: &str,
        issued_by: Option<&str>,
    ) -> Result<IssuedWarning, DbError> {
        let config = self.configs.get(community_id).await;
        let warning = self
            .ledger
            .record_violation(community_id, platform, user_id, WarningType::Manual, reason, issued_by, &config)
            .await?;
        let evaluation = self.ledger.evaluate(community_id, platform, user_id, &config).await?;

        let mut enforcement = evaluation.tier.enforcement().unwrap_or(Enforcement::Warn);
        if !config.auto_timeout_enabled && matches!(enforcement, Enforcement::Timeout { .. }) {
            enforcement = Enforcement::Warn;
        }

        let action = ModerationAction::new(
            community_id,
            platform,
            user_id,
            enforcement,
            reason.to_string(),
            issued_by.map(str::to_string),
        );
        self.launch(action, &config);

        info!(community_id, user_id, enforcement = enforcement.as_str(), "manual warning issued");
        Ok(IssuedWarning {
            warning,
            evaluation,
            enforcement,
        })
    }

    /// Sync an externally decided action, bypassing detection. Returns the
    /// persisted action with every target still pending.
    pub async fn sync_action(&self, request: SyncActionRequest) -> Result<ModerationAction, ValidationError> {
        if request.community_id.trim().is_empty() || request.platform_user_id.trim().is_empty() {
            return Err(ValidationError::Request("communityId and platformUserId are required".into()));
        }
        if request.enforcement.duration_minutes() == Some(0) {
            return Err(ValidationError::Zero("durationMinutes"));
        }

        let targets = match request.targets {
            Some(targets) if !targets.is_empty() => targets,
            _ => self.sync.platforms(),
        };
        let action = ModerationAction::new(
            &request.community_id,
            &request.platform,
            &request.platform_user_id,
            request.enforcement,
            request.reason,
            request.moderator_id,
        );

        self.report_reputation(&action);
        let action = self.sync.prepare(action, &targets).await;
        self.sync.spawn_delivery(action.clone());
        Ok(action)
    }
}

fn reason_label(reason: BlockReason) -> &'static str {
    match reason {
        BlockReason::RateLimited => "rate_limited",
        BlockReason::SpamDetected => "spam_detected",
        BlockReason::ContentFiltered => "content_filtered",
    }
}
