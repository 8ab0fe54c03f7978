//! Audit trail for schedule outcomes.
//!
//! Delivery is at-most-once: callers go through [`emit_best_effort`], which
//! logs a sink failure and drops the event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use flagsched_core::{FlagState, FlagUpdates, ScheduleId};

pub const SCHEDULE_APPLIED: &str = "flag_schedule.applied";
pub const SCHEDULE_FAILED: &str = "flag_schedule.failed";

/// An auditable schedule outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    ScheduleApplied {
        schedule_id: ScheduleId,
        flag_key: String,
        updates: FlagUpdates,
        applied_at: DateTime<Utc>,
        flag_state: FlagState,
    },
    ScheduleFailed {
        schedule_id: ScheduleId,
        flag_key: String,
        error_message: String,
        failed_at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleApplied { .. } => SCHEDULE_APPLIED,
            Self::ScheduleFailed { .. } => SCHEDULE_FAILED,
        }
    }

    pub fn schedule_id(&self) -> ScheduleId {
        match self {
            Self::ScheduleApplied { schedule_id, .. } | Self::ScheduleFailed { schedule_id, .. } => {
                *schedule_id
            }
        }
    }

    /// Event payload as delivered to the sink.
    pub fn payload(&self) -> Value {
        match self {
            Self::ScheduleApplied {
                schedule_id,
                flag_key,
                updates,
                applied_at,
                flag_state,
            } => json!({
                "scheduleId": schedule_id.to_string(),
                "flagKey": flag_key,
                "updates": updates,
                "appliedAt": rfc3339(applied_at),
                "flagState": flag_state,
            }),
            Self::ScheduleFailed {
                schedule_id,
                flag_key,
                error_message,
                failed_at,
            } => json!({
                "scheduleId": schedule_id.to_string(),
                "flagKey": flag_key,
                "errorMessage": error_message,
                "failedAt": rfc3339(failed_at),
            }),
        }
    }
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Audit sink error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_event(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Deliver `event`, logging (never returning) a sink failure.
pub async fn emit_best_effort(sink: &dyn AuditSink, event: &AuditEvent) {
    if let Err(err) = sink.log_event(event).await {
        warn!(
            event = event.name(),
            schedule_id = %event.schedule_id(),
            error = %err,
            "audit event dropped"
        );
    }
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            event = event.name(),
            payload = %event.payload(),
            "audit event"
        );
        Ok(())
    }
}

/// Records events in memory; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn log_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("audit sink is failing".to_string()));
        }
        self.events
            .lock()
            .map_err(|_| AuditError::Unavailable("audit sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn applied() -> AuditEvent {
        AuditEvent::ScheduleApplied {
            schedule_id: ScheduleId::new(),
            flag_key: "new-checkout".to_string(),
            updates: FlagUpdates::new().with("enabled", true),
            applied_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            flag_state: FlagState {
                enabled: true,
                rollout_percentage: 25,
            },
        }
    }

    #[test]
    fn applied_payload_shape() {
        let event = applied();
        assert_eq!(event.name(), "flag_schedule.applied");

        let payload = event.payload();
        assert_eq!(payload["scheduleId"], event.schedule_id().to_string());
        assert_eq!(payload["flagKey"], "new-checkout");
        assert_eq!(payload["updates"], json!({ "enabled": true }));
        assert_eq!(payload["appliedAt"], "2026-03-01T12:00:00.000Z");
        assert_eq!(payload["flagState"], json!({ "enabled": true, "rolloutPercentage": 25 }));
    }

    #[test]
    fn failed_payload_shape() {
        let event = AuditEvent::ScheduleFailed {
            schedule_id: ScheduleId::new(),
            flag_key: "new-checkout".to_string(),
            error_message: "Flag update failed: DB_ERROR".to_string(),
            failed_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        };
        assert_eq!(event.name(), "flag_schedule.failed");

        let payload = event.payload();
        assert_eq!(payload["errorMessage"], "Flag update failed: DB_ERROR");
        assert_eq!(payload["failedAt"], "2026-03-01T12:00:00.000Z");
    }

    #[tokio::test]
    async fn best_effort_swallows_sink_failures() {
        let sink = InMemoryAuditSink::new();
        sink.set_failing(true);
        emit_best_effort(&sink, &applied()).await;
        assert!(sink.events().is_empty());

        sink.set_failing(false);
        emit_best_effort(&sink, &applied()).await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        assert_eq!(TracingAuditSink.log_event(&applied()).await, Ok(()));
    }
}
