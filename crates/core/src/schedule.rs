//! Scheduled flag change: the unit of work of the schedule job.
//!
//! ## Lifecycle
//!
//! - created externally as `pending` with `retry_count = 0`
//! - success → `applied` (terminal, retry fields untouched)
//! - retryable failure → `failed` with `next_retry_at` set and `retry_count` incremented
//! - permanent failure → `failed` with `next_retry_at` absent (terminal)
//!
//! The record is only mutated by the invocation that holds its claim.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::flag::FlagUpdates;
use crate::id::{FlagId, ScheduleId};

/// Retry ceiling used when a schedule does not configure its own.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Persisted status of a schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Pending,
    Applied,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Applied => "applied",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "applied" => Ok(ScheduleStatus::Applied),
            "failed" => Ok(ScheduleStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown schedule status: {other}"
            ))),
        }
    }
}

/// A persisted intent to mutate one feature flag at or after `scheduled_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledChange {
    pub id: ScheduleId,
    pub flag_id: FlagId,
    pub updates: FlagUpdates,
    pub status: ScheduleStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Present iff a future retry attempt is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Earliest time the change is eligible to run.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledChange {
    /// Create a new pending schedule with the default retry ceiling.
    pub fn new(flag_id: FlagId, updates: FlagUpdates, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::new(),
            flag_id,
            updates,
            status: ScheduleStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            last_error: None,
            applied_at: None,
            scheduled_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Terminal: applied, or failed with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ScheduleStatus::Applied => true,
            ScheduleStatus::Failed => self.next_retry_at.is_none(),
            ScheduleStatus::Pending => false,
        }
    }

    /// Whether the claim predicate selects this record at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let actionable = match self.status {
            ScheduleStatus::Pending => true,
            // A failed row without a retry time is permanently dead.
            ScheduleStatus::Failed => self.next_retry_at.is_some(),
            ScheduleStatus::Applied => false,
        };

        actionable
            && self.scheduled_at <= now
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether another failure may still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Record a successful application. Retry fields are left as they are.
    pub fn mark_applied(&mut self, applied_at: DateTime<Utc>) {
        self.status = ScheduleStatus::Applied;
        self.applied_at = Some(applied_at);
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt. `next_retry_at = None` makes the failure permanent.
    pub fn mark_retry(
        &mut self,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: impl Into<String>,
    ) {
        self.status = ScheduleStatus::Failed;
        self.retry_count = retry_count;
        self.next_retry_at = next_retry_at;
        self.last_error = Some(last_error.into());
        self.updated_at = Utc::now();
    }

    /// Check the record-level invariants.
    ///
    /// An applied row may still carry the `next_retry_at` of its last failed
    /// attempt; applied rows are never claimed, so it is inert.
    pub fn validate(&self) -> DomainResult<()> {
        if self.retry_count > self.max_retries {
            return Err(DomainError::invariant(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }
}
