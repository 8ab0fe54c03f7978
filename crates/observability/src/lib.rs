//! Process-wide logging setup for the flag-schedule job.

/// Initialize tracing with the default filter (`RUST_LOG` overrides it).
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
