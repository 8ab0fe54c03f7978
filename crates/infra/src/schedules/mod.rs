//! Scheduled flag changes: claiming, outcome classification and the run loop.
//!
//! ## Design
//!
//! - Due schedules are claimed in batches with a time-bounded lease; rows
//!   claimed by another invocation are skipped, never waited on
//! - A batch's lease is renewed while it is processed, and every write-back
//!   is fenced by the batch's claim token
//! - Each claimed schedule is processed sequentially and its outcome is
//!   written back before the next one starts
//! - Failures are retried with exponential backoff until `max_retries`
//! - Audit events are best-effort and emitted only after the write-back
//!
//! ## Components
//!
//! - `ScheduleStore`: claim + status/retry persistence (in-memory or Postgres)
//! - `ScheduleProcessor`: decides and records the outcome of one schedule
//! - `RunOrchestrator`: drives one invocation and reports a `RunSummary`

pub mod classifier;
pub mod postgres;
pub mod runner;
pub mod store;

pub use classifier::{Outcome, PermanentFailure, ProcessError, Processed, ScheduleProcessor};
pub use postgres::PostgresScheduleStore;
pub use runner::{RunError, RunOrchestrator, RunSummary, RunnerConfig};
pub use store::{ClaimToken, ClaimedBatch, InMemoryScheduleStore, ScheduleStore, ScheduleStoreError};
