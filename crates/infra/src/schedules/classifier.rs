//! Outcome classification for one claimed schedule.
//!
//! Resolution order per schedule:
//! 0. claim no longer held by this run → skipped, nothing touched
//! 1. flag missing → permanent failure, retry count untouched
//! 2. update succeeds → applied (cache invalidated first, retry fields untouched)
//! 3. update fails → retry with backoff while `retry_count < max_retries`,
//!    otherwise permanent failure at the current count
//!
//! Every outcome is written back through the store before it is returned, so
//! the audit event attached to a [`Processed`] always describes durable state.
//! Write-backs carry the run's claim token; if another run has taken the row
//! over in the meantime the write is refused and no audit event is produced.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use flagsched_core::{next_retry_at, Flag, FlagState, ScheduleId, ScheduledChange};

use crate::audit::AuditEvent;
use crate::flags::{FlagCache, FlagError, FlagRepository};

use super::store::{ClaimToken, ScheduleStore, ScheduleStoreError};

pub const FLAG_NOT_FOUND: &str = "Flag not found (may have been deleted)";

/// Why a schedule will never be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentFailure {
    FlagNotFound,
    RetriesExhausted,
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied {
        applied_at: DateTime<Utc>,
    },
    RetryScheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    },
    PermanentlyFailed {
        reason: PermanentFailure,
        retry_count: u32,
        last_error: String,
    },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A recorded outcome plus the audit event to emit for it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub outcome: Outcome,
    pub audit: Option<AuditEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("claim on schedule {id} was lost to another run")]
    ClaimLost { id: ScheduleId },
    #[error("failed to record outcome for schedule {id}: {source}")]
    Store {
        id: ScheduleId,
        #[source]
        source: ScheduleStoreError,
    },
}

/// Runs the classification for claimed schedules against borrowed collaborators.
pub struct ScheduleProcessor<'a, S: ?Sized> {
    store: &'a S,
    flags: &'a dyn FlagRepository,
    cache: &'a dyn FlagCache,
}

impl<'a, S> ScheduleProcessor<'a, S>
where
    S: ScheduleStore + ?Sized,
{
    pub fn new(store: &'a S, flags: &'a dyn FlagRepository, cache: &'a dyn FlagCache) -> Self {
        Self { store, flags, cache }
    }

    /// Attempt `schedule` once under `token` and write the outcome back.
    pub async fn process(
        &self,
        token: ClaimToken,
        schedule: &ScheduledChange,
    ) -> Result<Processed, ProcessError> {
        let held = self
            .store
            .confirm_claim(schedule.id, token)
            .await
            .map_err(|source| store_error(schedule.id, source))?;
        if !held {
            return Err(ProcessError::ClaimLost { id: schedule.id });
        }

        let reference = schedule.flag_id.to_string();

        let flag = match self.flags.find_by_key_or_id(&reference).await {
            Ok(Some(flag)) => flag,
            Ok(None) => return self.flag_not_found(token, schedule, &reference).await,
            Err(err) => return self.attempt_failed(token, schedule, &reference, &err).await,
        };

        match self.flags.apply_update(&flag, &schedule.updates).await {
            Ok(state) => self.applied(token, schedule, &flag, state).await,
            Err(err) => self.attempt_failed(token, schedule, &flag.key, &err).await,
        }
    }

    async fn applied(
        &self,
        token: ClaimToken,
        schedule: &ScheduledChange,
        flag: &Flag,
        flag_state: FlagState,
    ) -> Result<Processed, ProcessError> {
        if let Err(err) = self.cache.invalidate(&flag.key).await {
            warn!(flag_key = %flag.key, error = %err, "flag cache invalidation failed");
        }

        let applied_at = Utc::now();
        self.store
            .mark_applied(schedule.id, token, applied_at)
            .await
            .map_err(|source| store_error(schedule.id, source))?;

        info!(schedule_id = %schedule.id, flag_key = %flag.key, "schedule applied");

        Ok(Processed {
            outcome: Outcome::Applied { applied_at },
            audit: Some(AuditEvent::ScheduleApplied {
                schedule_id: schedule.id,
                flag_key: flag.key.clone(),
                updates: schedule.updates.clone(),
                applied_at,
                flag_state,
            }),
        })
    }

    async fn flag_not_found(
        &self,
        token: ClaimToken,
        schedule: &ScheduledChange,
        reference: &str,
    ) -> Result<Processed, ProcessError> {
        self.store
            .mark_retry(schedule.id, token, schedule.retry_count, None, FLAG_NOT_FOUND)
            .await
            .map_err(|source| store_error(schedule.id, source))?;

        error!(schedule_id = %schedule.id, flag_id = %schedule.flag_id, "schedule target flag not found");

        Ok(Processed {
            outcome: Outcome::PermanentlyFailed {
                reason: PermanentFailure::FlagNotFound,
                retry_count: schedule.retry_count,
                last_error: FLAG_NOT_FOUND.to_string(),
            },
            audit: Some(AuditEvent::ScheduleFailed {
                schedule_id: schedule.id,
                flag_key: reference.to_string(),
                error_message: FLAG_NOT_FOUND.to_string(),
                failed_at: Utc::now(),
            }),
        })
    }

    async fn attempt_failed(
        &self,
        token: ClaimToken,
        schedule: &ScheduledChange,
        flag_key: &str,
        err: &FlagError,
    ) -> Result<Processed, ProcessError> {
        let last_error = failure_message(err);
        let retry_count = schedule.retry_count;

        if schedule.has_retries_left() {
            let next_retry_at = next_retry_at(Utc::now(), retry_count);
            self.store
                .mark_retry(schedule.id, token, retry_count + 1, Some(next_retry_at), &last_error)
                .await
                .map_err(|source| store_error(schedule.id, source))?;

            warn!(
                schedule_id = %schedule.id,
                flag_key,
                retry_count = retry_count + 1,
                max_retries = schedule.max_retries,
                %next_retry_at,
                error = %last_error,
                "schedule failed, retry scheduled"
            );

            return Ok(Processed {
                outcome: Outcome::RetryScheduled {
                    retry_count: retry_count + 1,
                    next_retry_at,
                    last_error,
                },
                audit: None,
            });
        }

        self.store
            .mark_retry(schedule.id, token, retry_count, None, &last_error)
            .await
            .map_err(|source| store_error(schedule.id, source))?;

        error!(
            schedule_id = %schedule.id,
            flag_key,
            retry_count,
            error = %last_error,
            "schedule failed permanently, retries exhausted"
        );

        Ok(Processed {
            audit: Some(AuditEvent::ScheduleFailed {
                schedule_id: schedule.id,
                flag_key: flag_key.to_string(),
                error_message: last_error.clone(),
                failed_at: Utc::now(),
            }),
            outcome: Outcome::PermanentlyFailed {
                reason: PermanentFailure::RetriesExhausted,
                retry_count,
                last_error,
            },
        })
    }
}

fn store_error(id: ScheduleId, source: ScheduleStoreError) -> ProcessError {
    match source {
        ScheduleStoreError::ClaimLost(_) => ProcessError::ClaimLost { id },
        source => ProcessError::Store { id, source },
    }
}

/// `last_error` text for a failed attempt.
///
/// Business rejections get the `Flag update failed:` prefix; backend errors
/// are recorded as raised.
pub fn failure_message(err: &FlagError) -> String {
    match err {
        FlagError::Update(reason) => format!("Flag update failed: {reason}"),
        FlagError::Backend(message) => message.clone(),
    }
}
