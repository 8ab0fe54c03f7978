//! `flagsched-core` — domain building blocks for scheduled flag changes.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! schedule record and its state machine helpers, the flag boundary types and
//! the retry backoff curve.

pub mod backoff;
pub mod error;
pub mod flag;
pub mod id;
pub mod schedule;

pub use backoff::{backoff, base_delay, next_retry_at, MAX_JITTER_MS};
pub use error::{DomainError, DomainResult};
pub use flag::{Flag, FlagState, FlagUpdates};
pub use id::{FlagId, ScheduleId};
pub use schedule::{ScheduleStatus, ScheduledChange, DEFAULT_MAX_RETRIES};
