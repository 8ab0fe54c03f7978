//! Environment configuration.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | unset → in-memory stores |
//! | `BIND_ADDR` | `0.0.0.0:8080` |
//! | `SCHEDULE_BATCH_LIMIT` | `100` |
//! | `SCHEDULE_CLAIM_LEASE_SECS` | `300` |

use std::str::FromStr;

use chrono::Duration;

use flagsched_infra::schedules::runner::DEFAULT_BATCH_LIMIT;
use flagsched_infra::schedules::store::DEFAULT_CLAIM_LEASE_SECS;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub batch_limit: usize,
    pub claim_lease: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

impl JobConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lease_secs: i64 = positive(&lookup, "SCHEDULE_CLAIM_LEASE_SECS", DEFAULT_CLAIM_LEASE_SECS)?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            batch_limit: positive(&lookup, "SCHEDULE_BATCH_LIMIT", defaults.batch_limit)?,
            claim_lease: Duration::seconds(lease_secs),
        })
    }
}

fn positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .ok()
            .filter(|v| *v > T::default())
            .ok_or(ConfigError::InvalidNumber { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = JobConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, JobConfig::default());
        assert_eq!(config.batch_limit, 100);
        assert_eq!(config.claim_lease, Duration::minutes(5));
    }

    #[test]
    fn reads_overrides() {
        let config = JobConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/flags"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("SCHEDULE_BATCH_LIMIT", "25"),
            ("SCHEDULE_CLAIM_LEASE_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/flags"));
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.batch_limit, 25);
        assert_eq!(config.claim_lease, Duration::seconds(60));
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let config = JobConfig::from_lookup(lookup(&[("DATABASE_URL", " ")])).unwrap();
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(
            JobConfig::from_lookup(lookup(&[("SCHEDULE_BATCH_LIMIT", "lots")])),
            Err(ConfigError::InvalidNumber {
                name: "SCHEDULE_BATCH_LIMIT",
                value: "lots".to_string(),
            })
        );
        assert!(JobConfig::from_lookup(lookup(&[("SCHEDULE_CLAIM_LEASE_SECS", "0")])).is_err());
        assert!(JobConfig::from_lookup(lookup(&[("SCHEDULE_CLAIM_LEASE_SECS", "-5")])).is_err());
    }
}
