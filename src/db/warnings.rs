//! Repository for the append-only warning ledger.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{from_millis, retry_once, to_millis, DbError};
use crate::models::{WarningRecord, WarningStatus, WarningType};

/// Selection for warning listings.
#[derive(Debug, Clone, Default)]
pub struct WarningFilter {
    pub status: WarningStatus,
    pub platform: Option<String>,
    pub platform_user_id: Option<String>,
}

pub struct WarningRepository<'a> {
    pool: &'a SqlitePool,
}

const COLUMNS: &str = "id, community_id, platform, platform_user_id, warning_type, reason, issued_by, \
     issued_at, expires_at, is_active, revoked_by, revoked_reason, revoked_at";

fn warning_from_row(row: &SqliteRow) -> Result<WarningRecord, DbError> {
    let warning_type: String = row.try_get("warning_type")?;
    let revoked_at: Option<i64> = row.try_get("revoked_at")?;
    Ok(WarningRecord {
        id: row.try_get("id")?,
        community_id: row.try_get("community_id")?,
        platform: row.try_get("platform")?,
        platform_user_id: row.try_get("platform_user_id")?,
        warning_type: WarningType::parse(&warning_type)
            .ok_or_else(|| DbError::Corrupt(format!("unknown warning type {warning_type:?}")))?,
        reason: row.try_get("reason")?,
        issued_by: row.try_get("issued_by")?,
        issued_at: from_millis(row.try_get("issued_at")?)?,
        expires_at: from_millis(row.try_get("expires_at")?)?,
        is_active: row.try_get("is_active")?,
        revoked_by: row.try_get("revoked_by")?,
        revoked_reason: row.try_get("revoked_reason")?,
        revoked_at: revoked_at.map(from_millis).transpose()?,
    })
}

fn push_filters<'q>(
    qb: &mut QueryBuilder<'q, Sqlite>,
    community_id: &'q str,
    filter: &'q WarningFilter,
    now: i64,
) {
    qb.push(" WHERE community_id = ").push_bind(community_id);
    match filter.status {
        WarningStatus::Active => {
            qb.push(" AND is_active = 1 AND expires_at > ").push_bind(now);
        }
        WarningStatus::Expired => {
            qb.push(" AND is_active = 1 AND expires_at <= ").push_bind(now);
        }
        WarningStatus::All => {}
    }
    if let Some(platform) = &filter.platform {
        qb.push(" AND platform = ").push_bind(platform.as_str());
    }
    if let Some(user) = &filter.platform_user_id {
        qb.push(" AND platform_user_id = ").push_bind(user.as_str());
    }
}

impl<'a> WarningRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, warning: &WarningRecord) -> Result<(), DbError> {
        let pool = self.pool;
        retry_once(|| async move {
            sqlx::query(
                r#"
                INSERT INTO warnings (id, community_id, platform, platform_user_id, warning_type,
                                      reason, issued_by, issued_at, expires_at, is_active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&warning.id)
            .bind(&warning.community_id)
            .bind(&warning.platform)
            .bind(&warning.platform_user_id)
            .bind(warning.warning_type.as_str())
            .bind(&warning.reason)
            .bind(&warning.issued_by)
            .bind(to_millis(warning.issued_at))
            .bind(to_millis(warning.expires_at))
            .bind(warning.is_active)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Warnings that are active and not yet decayed at `now`.
    pub async fn count_active(
        &self,
        community_id: &str,
        platform: &str,
        platform_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, DbError> {
        let pool = self.pool;
        let now = to_millis(now);
        let count: i64 = retry_once(|| async move {
            Ok(sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM warnings
                WHERE community_id = ? AND platform = ? AND platform_user_id = ?
                  AND is_active = 1 AND expires_at > ?
                "#,
            )
            .bind(community_id)
            .bind(platform)
            .bind(platform_user_id)
            .bind(now)
            .fetch_one(pool)
            .await?)
        })
        .await?;
        Ok(count as u32)
    }

    pub async fn get(&self, community_id: &str, id: &str) -> Result<WarningRecord, DbError> {
        let pool = self.pool;
        let row = retry_once(|| async move {
            Ok(sqlx::query(&format!(
                "SELECT {COLUMNS} FROM warnings WHERE community_id = ? AND id = ?"
            ))
            .bind(community_id)
            .bind(id)
            .fetch_optional(pool)
            .await?)
        })
        .await?;

        match row {
            Some(row) => warning_from_row(&row),
            None => Err(DbError::NotFound(format!("warning {id}"))),
        }
    }

    /// Newest first, with the total number of matching rows.
    pub async fn list(
        &self,
        community_id: &str,
        filter: &WarningFilter,
        now: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WarningRecord>, i64), DbError> {
        let pool = self.pool;
        let now = to_millis(now);

        let total: i64 = retry_once(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM warnings");
            push_filters(&mut qb, community_id, filter, now);
            Ok(qb.build_query_scalar::<i64>().fetch_one(pool).await?)
        })
        .await?;

        let rows = retry_once(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM warnings"));
            push_filters(&mut qb, community_id, filter, now);
            qb.push(" ORDER BY issued_at DESC, id DESC LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind(offset);
            Ok(qb.build().fetch_all(pool).await?)
        })
        .await?;

        let warnings = rows.iter().map(warning_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((warnings, total))
    }

    /// Mark a warning inactive. Revoking twice keeps the first revocation.
    pub async fn revoke(
        &self,
        community_id: &str,
        id: &str,
        revoked_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WarningRecord, DbError> {
        let pool = self.pool;
        let now = to_millis(now);
        retry_once(|| async move {
            sqlx::query(
                r#"
                UPDATE warnings
                SET is_active = 0, revoked_by = ?, revoked_reason = ?, revoked_at = ?
                WHERE community_id = ? AND id = ? AND is_active = 1
                "#,
            )
            .bind(revoked_by)
            .bind(reason)
            .bind(now)
            .bind(community_id)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await?;

        self.get(community_id, id).await
    }
}
