//! Repository for the write-once audit trail: filter matches and moderation
//! actions with their per-platform sync results.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, retry_once, to_millis, DbError};
use crate::models::{Enforcement, FilterMatch, ModerationAction};
use crate::security::FilterAction;

pub struct AuditRepository<'a> {
    pool: &'a SqlitePool,
}

fn filter_match_from_row(row: &SqliteRow) -> Result<FilterMatch, DbError> {
    let action: String = row.try_get("action")?;
    Ok(FilterMatch {
        id: row.try_get("id")?,
        community_id: row.try_get("community_id")?,
        platform: row.try_get("platform")?,
        platform_user_id: row.try_get("platform_user_id")?,
        message_excerpt: row.try_get("message_excerpt")?,
        matched_pattern: row.try_get("matched_pattern")?,
        action: FilterAction::parse(&action)
            .ok_or_else(|| DbError::Corrupt(format!("unknown filter action {action:?}")))?,
        matched_at: from_millis(row.try_get("matched_at")?)?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<ModerationAction, DbError> {
    let action_type: String = row.try_get("action_type")?;
    let duration: Option<i64> = row.try_get("duration_minutes")?;
    let enforcement = Enforcement::from_parts(&action_type, duration.map(|d| d as u32))
        .ok_or_else(|| DbError::Corrupt(format!("unknown action type {action_type:?}")))?;
    let targets: String = row.try_get("sync_targets")?;
    let results: String = row.try_get("sync_results")?;

    Ok(ModerationAction {
        id: row.try_get("id")?,
        community_id: row.try_get("community_id")?,
        platform: row.try_get("platform")?,
        platform_user_id: row.try_get("platform_user_id")?,
        enforcement,
        reason: row.try_get("reason")?,
        moderator_id: row.try_get("moderator_id")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        sync_targets: serde_json::from_str(&targets)?,
        sync_results: serde_json::from_str(&results)?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

impl<'a> AuditRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_filter_match(&self, hit: &FilterMatch) -> Result<(), DbError> {
        let pool = self.pool;
        retry_once(|| async move {
            sqlx::query(
                r#"
                INSERT INTO filter_matches (id, community_id, platform, platform_user_id,
                                            message_excerpt, matched_pattern, action, matched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&hit.id)
            .bind(&hit.community_id)
            .bind(&hit.platform)
            .bind(&hit.platform_user_id)
            .bind(&hit.message_excerpt)
            .bind(&hit.matched_pattern)
            .bind(hit.action.as_str())
            .bind(to_millis(hit.matched_at))
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn list_filter_matches(
        &self,
        community_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<FilterMatch>, i64), DbError> {
        let pool = self.pool;
        let total = retry_once(|| async move {
            Ok(sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM filter_matches WHERE community_id = ?",
            )
            .bind(community_id)
            .fetch_one(pool)
            .await?)
        })
        .await?;

        let rows = retry_once(|| async move {
            Ok(sqlx::query(
                r#"
                SELECT * FROM filter_matches WHERE community_id = ?
                ORDER BY matched_at DESC, id DESC LIMIT ? OFFSET ?
                "#,
            )
            .bind(community_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?)
        })
        .await?;

        let matches = rows.iter().map(filter_match_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((matches, total))
    }

    pub async fn insert_action(&self, action: &ModerationAction) -> Result<(), DbError> {
        let pool = self.pool;
        let targets = serde_json::to_string(&action.sync_targets)?;
        let results = serde_json::to_string(&action.sync_results)?;
        let (targets, results) = (targets.as_str(), results.as_str());

        retry_once(|| async move {
            sqlx::query(
                r#"
                INSERT INTO moderation_actions (id, community_id, platform, platform_user_id,
                    action_type, duration_minutes, reason, moderator_id, created_at,
                    idempotency_key, sync_targets, sync_results)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&action.id)
            .bind(&action.community_id)
            .bind(&action.platform)
            .bind(&action.platform_user_id)
            .bind(action.enforcement.as_str())
            .bind(action.enforcement.duration_minutes().map(i64::from))
            .bind(&action.reason)
            .bind(&action.moderator_id)
            .bind(to_millis(action.created_at))
            .bind(&action.idempotency_key)
            .bind(targets)
            .bind(results)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Record the final per-platform sync results of an action.
    pub async fn update_sync_results(&self, action: &ModerationAction) -> Result<(), DbError> {
        let pool = self.pool;
        let results = serde_json::to_string(&action.sync_results)?;
        let results = results.as_str();

        let updated = retry_once(|| async move {
            Ok(sqlx::query("UPDATE moderation_actions SET sync_results = ? WHERE id = ?")
                .bind(results)
                .bind(&action.id)
                .execute(pool)
                .await?
                .rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(DbError::NotFound(format!("moderation action {}", action.id)));
        }
        Ok(())
    }

    pub async fn get_action(&self, id: &str) -> Result<ModerationAction, DbError> {
        let pool = self.pool;
        let row = retry_once(|| async move {
            Ok(sqlx::query("SELECT * FROM moderation_actions WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?)
        })
        .await?;

        match row {
            Some(row) => action_from_row(&row),
            None => Err(DbError::NotFound(format!("moderation action {id}"))),
        }
    }

    pub async fn list_actions(
        &self,
        community_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ModerationAction>, i64), DbError> {
        let pool = self.pool;
        let total = retry_once(|| async move {
            Ok(sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM moderation_actions WHERE community_id = ?",
            )
            .bind(community_id)
            .fetch_one(pool)
            .await?)
        })
        .await?;

        let rows = retry_once(|| async move {
            Ok(sqlx::query(
                r#"
                SELECT * FROM moderation_actions WHERE community_id = ?
                ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?
                "#,
            )
            .bind(community_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?)
        })
        .await?;

        let actions = rows.iter().map(action_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((actions, total))
    }
}
