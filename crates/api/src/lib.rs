//! HTTP entry point for the flag-schedule job.

pub mod app;
pub mod config;
