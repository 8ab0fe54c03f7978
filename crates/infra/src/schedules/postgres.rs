//! Postgres-backed schedule store.
//!
//! ## Claim protocol
//!
//! `claim_due` is a single statement: an inner `SELECT … FOR UPDATE SKIP LOCKED`
//! picks due rows that nobody else is locking, and the outer `UPDATE` stamps
//! them with `claimed_until = NOW() + lease`. Concurrent invocations therefore
//! partition the due set, and once the statement commits the lease keeps the
//! rows out of other claims until the outcome is written back (or the lease
//! elapses after a crash).
//!
//! The same statement stamps every claimed row with the batch's
//! `claim_token`. Renewal, confirmation and write-back all match on
//! `id AND claim_token`, so a holder whose lease lapsed and whose rows were
//! re-claimed elsewhere matches zero rows and gets `ClaimLost`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ScheduleStoreError |
//! |------------|----------------------|--------------------|
//! | Database (integrity violation) | `23xxx` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use flagsched_core::{
    FlagId, FlagUpdates, ScheduleId, ScheduleStatus, ScheduledChange,
};

use super::store::{
    ClaimToken, ClaimedBatch, ScheduleStore, ScheduleStoreError, DEFAULT_CLAIM_LEASE_SECS,
};

const SCHEDULE_COLUMNS: &str = r#"
    id,
    flag_id,
    updates,
    status,
    retry_count,
    max_retries,
    next_retry_at,
    last_error,
    applied_at,
    scheduled_at,
    created_at,
    updated_at
"#;

/// Postgres-backed schedule store (`feature_flag_schedules` table).
#[derive(Debug, Clone)]
pub struct PostgresScheduleStore {
    pool: Arc<PgPool>,
    lease: Duration,
}

impl PostgresScheduleStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    /// Override how long a claim stays exclusive.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Insert a new schedule.
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id), err)]
    pub async fn insert(&self, schedule: &ScheduledChange) -> Result<ScheduleId, ScheduleStoreError> {
        schedule
            .validate()
            .map_err(|e| ScheduleStoreError::Conflict(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO feature_flag_schedules (
                id,
                flag_id,
                updates,
                status,
                retry_count,
                max_retries,
                next_retry_at,
                last_error,
                applied_at,
                scheduled_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.flag_id.as_uuid())
        .bind(schedule.updates.to_value())
        .bind(schedule.status.as_str())
        .bind(to_db_count("retry_count", schedule.retry_count)?)
        .bind(to_db_count("max_retries", schedule.max_retries)?)
        .bind(schedule.next_retry_at)
        .bind(schedule.last_error.as_deref())
        .bind(schedule.applied_at)
        .bind(schedule.scheduled_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ScheduleStoreError::AlreadyExists(schedule.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(schedule.id)
    }

    /// Load a schedule by id.
    pub async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledChange>, ScheduleStoreError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM feature_flag_schedules WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    fn lease_secs(&self) -> f64 {
        self.lease.num_milliseconds() as f64 / 1000.0
    }

    async fn ensure_exists(&self, id: ScheduleId) -> Result<(), ScheduleStoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM feature_flag_schedules WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_exists", e))?;
        if exists {
            Ok(())
        } else {
            Err(ScheduleStoreError::NotFound(id))
        }
    }

    /// Explain a write-back that matched no row.
    async fn claim_lost_or_missing(&self, id: ScheduleId) -> ScheduleStoreError {
        match self.ensure_exists(id).await {
            Ok(()) => ScheduleStoreError::ClaimLost(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    #[instrument(skip(self), err)]
    async fn claim_due(&self, limit: usize) -> Result<ClaimedBatch, ScheduleStoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| ScheduleStoreError::Storage(format!("claim limit out of range: {limit}")))?;
        let token = ClaimToken::new();

        let sql = format!(
            r#"
            UPDATE feature_flag_schedules
            SET claimed_until = NOW() + make_interval(secs => $2),
                claim_token = $3
            WHERE id IN (
                SELECT id
                FROM feature_flag_schedules
                WHERE status IN ('pending', 'failed')
                    AND (status = 'pending' OR next_retry_at IS NOT NULL)
                    AND scheduled_at <= NOW()
                    AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                    AND (claimed_until IS NULL OR claimed_until <= NOW())
                ORDER BY scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(self.lease_secs())
            .bind(token.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut schedules = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the sub-select order.
        schedules.sort_by_key(|s| (s.scheduled_at, s.id));

        debug!(count = schedules.len(), claim_token = %token, "claimed due schedules");
        Ok(ClaimedBatch {
            token,
            lease: self.lease,
            schedules,
        })
    }

    #[instrument(skip(self), fields(claim_token = %token), err)]
    async fn renew_claim(&self, token: ClaimToken) -> Result<u64, ScheduleStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feature_flag_schedules
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE claim_token = $1
            "#,
        )
        .bind(token.as_uuid())
        .bind(self.lease_secs())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_claim", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(schedule_id = %id, claim_token = %token), err)]
    async fn confirm_claim(&self, id: ScheduleId, token: ClaimToken) -> Result<bool, ScheduleStoreError> {
        // A lapsed lease still counts as held until another claim takes the row.
        let result = sqlx::query(
            r#"
            UPDATE feature_flag_schedules
            SET claimed_until = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(self.lease_secs())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("confirm_claim", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists(id).await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(schedule_id = %id, claim_token = %token), err)]
    async fn mark_applied(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        applied_at: DateTime<Utc>,
    ) -> Result<(), ScheduleStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feature_flag_schedules
            SET status = 'applied',
                applied_at = $3,
                claimed_until = NULL,
                claim_token = NULL,
                updated_at = NOW()
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(applied_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_applied", e))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, last_error), fields(schedule_id = %id, claim_token = %token), err)]
    async fn mark_retry(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<(), ScheduleStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feature_flag_schedules
            SET status = 'failed',
                retry_count = $3,
                next_retry_at = $4,
                last_error = $5,
                claimed_until = NULL,
                claim_token = NULL,
                updated_at = NOW()
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(to_db_count("retry_count", retry_count)?)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(id).await);
        }
        Ok(())
    }
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<ScheduledChange, ScheduleStoreError> {
    let decode = |e: sqlx::Error| ScheduleStoreError::Storage(format!("failed to decode schedule row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let updates: serde_json::Value = row.try_get("updates").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(decode)?;

    Ok(ScheduledChange {
        id: ScheduleId::from_uuid(row.try_get("id").map_err(decode)?),
        flag_id: FlagId::from_uuid(row.try_get("flag_id").map_err(decode)?),
        updates: FlagUpdates::try_from(updates)
            .map_err(|e| ScheduleStoreError::Storage(e.to_string()))?,
        status: status
            .parse::<ScheduleStatus>()
            .map_err(|e| ScheduleStoreError::Storage(e.to_string()))?,
        retry_count: from_db_count("retry_count", retry_count)?,
        max_retries: from_db_count("max_retries", max_retries)?,
        next_retry_at: row.try_get("next_retry_at").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        applied_at: row.try_get("applied_at").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn to_db_count(column: &str, value: u32) -> Result<i32, ScheduleStoreError> {
    i32::try_from(value)
        .map_err(|_| ScheduleStoreError::Storage(format!("{column} out of range: {value}")))
}

fn from_db_count(column: &str, value: i32) -> Result<u32, ScheduleStoreError> {
    u32::try_from(value)
        .map_err(|_| ScheduleStoreError::Storage(format!("negative {column} in database: {value}")))
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ScheduleStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                // Integrity constraint class (unique, check, foreign key, not null).
                Some(code) if code.starts_with("23") => ScheduleStoreError::Conflict(msg),
                _ => ScheduleStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            ScheduleStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => ScheduleStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
