//! Postgres-backed flag repository (`feature_flags` table).
//!
//! Only the `enabled` and `rolloutPercentage` update fields map to columns;
//! unknown fields are ignored by the statement. A check-constraint violation
//! (SQLSTATE `23514`) is the flag store rejecting the update and surfaces as
//! `FlagError::Update`; everything else is `FlagError::Backend`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use flagsched_core::{Flag, FlagId, FlagState, FlagUpdates};

use super::{FlagError, FlagRepository};

#[derive(Debug, Clone)]
pub struct PostgresFlagRepository {
    pool: Arc<PgPool>,
}

impl PostgresFlagRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl FlagRepository for PostgresFlagRepository {
    #[instrument(skip(self), err)]
    async fn find_by_key_or_id(&self, reference: &str) -> Result<Option<Flag>, FlagError> {
        let row = sqlx::query(
            r#"
            SELECT id, flag_key, enabled, rollout_percentage, environment
            FROM feature_flags
            WHERE flag_key = $1 OR id::text = $1
            ORDER BY (id::text = $1) DESC
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_key_or_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| FlagError::backend(format!("failed to decode flag row: {e}"));
        Ok(Some(Flag {
            id: FlagId::from_uuid(row.try_get("id").map_err(decode)?),
            key: row.try_get("flag_key").map_err(decode)?,
            enabled: row.try_get("enabled").map_err(decode)?,
            rollout_percentage: row.try_get("rollout_percentage").map_err(decode)?,
            environment: row.try_get("environment").map_err(decode)?,
        }))
    }

    #[instrument(skip(self, flag, updates), fields(flag_key = %flag.key), err)]
    async fn apply_update(&self, flag: &Flag, updates: &FlagUpdates) -> Result<FlagState, FlagError> {
        let row = sqlx::query(
            r#"
            UPDATE feature_flags
            SET enabled = COALESCE(($2::jsonb ->> 'enabled')::boolean, enabled),
                rollout_percentage = COALESCE(($2::jsonb ->> 'rolloutPercentage')::int, rollout_percentage),
                updated_at = NOW()
            WHERE id = $1
            RETURNING enabled, rollout_percentage
            "#,
        )
        .bind(flag.id.as_uuid())
        .bind(updates.to_value())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply_update", e))?;

        let Some(row) = row else {
            return Err(FlagError::update("NOT_FOUND"));
        };

        let decode = |e: sqlx::Error| FlagError::backend(format!("failed to decode flag row: {e}"));
        Ok(FlagState {
            enabled: row.try_get("enabled").map_err(decode)?,
            rollout_percentage: row.try_get("rollout_percentage").map_err(decode)?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> FlagError {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // check_violation, invalid_text_representation
            Some(code) if code == "23514" || code == "22P02" => {
                FlagError::update(db_err.message().to_string())
            }
            _ => FlagError::backend(format!(
                "database error in {}: {}",
                operation,
                db_err.message()
            )),
        },
        sqlx::Error::PoolClosed => {
            FlagError::backend(format!("connection pool closed in {}", operation))
        }
        _ => FlagError::backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_is_a_backend_error() {
        assert_eq!(
            map_sqlx_error("apply_update", sqlx::Error::PoolClosed),
            FlagError::backend("connection pool closed in apply_update")
        );
    }
}
