//! Infrastructure layer: schedule persistence, flag/cache/audit adapters and
//! the schedule job runner.

pub mod audit;
pub mod flags;
pub mod migrations;
pub mod schedules;
