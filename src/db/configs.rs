//! Repository for per-community security configuration.

use sqlx::SqlitePool;

use super::{retry_once, to_millis, DbError};
use crate::security::SecurityConfig;

pub struct ConfigRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConfigRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, community_id: &str) -> Result<Option<SecurityConfig>, DbError> {
        let pool = self.pool;
        let raw: Option<String> = retry_once(|| async move {
            Ok(
                sqlx::query_scalar::<_, String>("SELECT config FROM security_configs WHERE community_id = ?")
                    .bind(community_id)
                    .fetch_optional(pool)
                    .await?,
            )
        })
        .await?;

        raw.map(|json| serde_json::from_str(&json).map_err(DbError::from))
            .transpose()
    }

    pub async fn save(&self, community_id: &str, config: &SecurityConfig) -> Result<(), DbError> {
        let pool = self.pool;
        let json = serde_json::to_string(config)?;
        let json = json.as_str();
        let now = to_millis(chrono::Utc::now());

        retry_once(|| async move {
            sqlx::query(
                r#"
                INSERT INTO security_configs (community_id, config, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(community_id) DO UPDATE SET
                    config = excluded.config,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(community_id)
            .bind(json)
            .bind(now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }
}
