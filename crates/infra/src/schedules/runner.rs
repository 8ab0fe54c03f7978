//! One invocation of the flag-schedule job.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::{emit_best_effort, AuditSink};
use crate::flags::{FlagCache, FlagRepository};

use super::classifier::{ProcessError, ScheduleProcessor};
use super::store::{ClaimedBatch, ScheduleStore, ScheduleStoreError};

/// Default number of schedules claimed per invocation.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Upper bound on schedules claimed per run; the rest wait for the next run.
    pub batch_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl RunnerConfig {
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }
}

/// Counts reported by a completed run.
///
/// `failed` counts schedules that did not reach `applied` in this run,
/// whether a retry was scheduled or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub processed: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

/// Invocation-level failure. Nothing in the batch was processed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    Claim(#[from] ScheduleStoreError),
}

/// Claims a batch of due schedules and processes it sequentially.
///
/// The batch's lease is renewed alongside the processing loop, so a
/// slow flag backend cannot let the rows slip to an overlapping run. A row
/// whose claim is lost anyway is skipped and counted in neither total.
pub struct RunOrchestrator<S> {
    store: S,
    flags: Arc<dyn FlagRepository>,
    cache: Arc<dyn FlagCache>,
    audit: Arc<dyn AuditSink>,
    config: RunnerConfig,
}

impl<S: ScheduleStore> RunOrchestrator<S> {
    pub fn new(
        store: S,
        flags: Arc<dyn FlagRepository>,
        cache: Arc<dyn FlagCache>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            flags,
            cache,
            audit,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one invocation.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let span = info_span!("flag_schedule_run", run_id = %Uuid::now_v7());
        self.run_batch().instrument(span).await
    }

    async fn run_batch(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();

        let batch = self.store.claim_due(self.config.batch_limit).await.map_err(|e| {
            error!(error = %e, "failed to claim due schedules");
            RunError::Claim(e)
        })?;

        if batch.is_empty() {
            info!("no due schedules");
            return Ok(RunSummary {
                processed: 0,
                failed: 0,
                duration_ms: elapsed_ms(started),
            });
        }

        info!(count = batch.len(), claim_token = %batch.token, "processing due schedules");

        let (processed, failed) = self.with_heartbeat(&batch, self.process_batch(&batch)).await;

        let summary = RunSummary {
            processed,
            failed,
            duration_ms: elapsed_ms(started),
        };
        info!(
            processed = summary.processed,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "flag schedule run complete"
        );
        Ok(summary)
    }

    /// Process the batch in claim order; returns `(processed, failed)`.
    async fn process_batch(&self, batch: &ClaimedBatch) -> (u64, u64) {
        let processor = ScheduleProcessor::new(&self.store, self.flags.as_ref(), self.cache.as_ref());
        let mut processed = 0u64;
        let mut failed = 0u64;

        for schedule in &batch.schedules {
            match processor.process(batch.token, schedule).await {
                Ok(result) => {
                    if result.outcome.is_applied() {
                        processed += 1;
                    } else {
                        failed += 1;
                    }
                    if let Some(event) = &result.audit {
                        emit_best_effort(self.audit.as_ref(), event).await;
                    }
                }
                Err(ProcessError::ClaimLost { id }) => {
                    // Another run owns the row now and reports its outcome.
                    warn!(schedule_id = %id, "claim lost, schedule skipped");
                }
                Err(err) => {
                    // The lease expires and the row is picked up by a later run.
                    error!(schedule_id = %schedule.id, error = %err, "schedule outcome not recorded");
                    failed += 1;
                }
            }
        }

        (processed, failed)
    }

    /// Drive `work` while renewing the batch's lease every third of its length.
    async fn with_heartbeat<F: Future>(&self, batch: &ClaimedBatch, work: F) -> F::Output {
        let Some(period) = heartbeat_period(batch.lease) else {
            return work.await;
        };

        let mut work = pin!(work);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.store.renew_claim(batch.token).await {
                    Ok(renewed) => debug!(renewed, "claim lease renewed"),
                    Err(err) => warn!(error = %err, "claim lease renewal failed"),
                },
            }
        }
    }
}

fn heartbeat_period(lease: Duration) -> Option<std::time::Duration> {
    let period = lease.to_std().ok()? / 3;
    (!period.is_zero()).then_some(period)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
