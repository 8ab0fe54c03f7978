//! Feature-flag boundary types.
//!
//! The flag entity itself is owned by the flag store; the job only needs to
//! resolve it, hand it an opaque update document and report the result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::id::FlagId;

/// The subset of a feature flag the schedule job reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: FlagId,
    /// Stable, human-facing key (used for cache invalidation and audit).
    pub key: String,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub environment: String,
}

impl Flag {
    /// Snapshot of the fields that schedules mutate.
    pub fn state(&self) -> FlagState {
        FlagState {
            enabled: self.enabled,
            rollout_percentage: self.rollout_percentage,
        }
    }
}

/// Post-update snapshot reported in the `flag_schedule.applied` audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    pub enabled: bool,
    pub rollout_percentage: i32,
}

/// Opaque update document: field name → new value.
///
/// The job never interprets the contents; only the flag mutator does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagUpdates(Map<String, Value>);

impl FlagUpdates {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for FlagUpdates {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for FlagUpdates {
    type Error = DomainError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DomainError::validation(format!(
                "flag updates must be a JSON object, got {other}"
            ))),
        }
    }
}
