//! In-memory flag repository and cache for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use flagsched_core::{Flag, FlagId, FlagState, FlagUpdates};

use super::{FlagCache, FlagError, FlagRepository};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, FlagError> {
    mutex
        .lock()
        .map_err(|_| FlagError::backend("in-memory flag store lock poisoned"))
}

/// In-memory flag repository.
///
/// Understands the `enabled` and `rolloutPercentage` update fields; other
/// fields are accepted and ignored. Failures can be injected for tests.
#[derive(Debug, Default)]
pub struct InMemoryFlagRepository {
    flags: Mutex<HashMap<FlagId, Flag>>,
    lookup_failure: Mutex<Option<FlagError>>,
    update_failure: Mutex<Option<FlagError>>,
}

impl InMemoryFlagRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flag: Flag) {
        if let Ok(mut flags) = lock(&self.flags) {
            flags.insert(flag.id, flag);
        }
    }

    /// Delete a flag (schedules referencing it become unresolvable).
    pub fn remove(&self, id: FlagId) -> Option<Flag> {
        lock(&self.flags).ok()?.remove(&id)
    }

    pub fn get(&self, id: FlagId) -> Option<Flag> {
        lock(&self.flags).ok()?.get(&id).cloned()
    }

    /// Make every subsequent lookup fail with `err`.
    pub fn fail_lookups_with(&self, err: FlagError) {
        if let Ok(mut slot) = lock(&self.lookup_failure) {
            *slot = Some(err);
        }
    }

    /// Make every subsequent update fail with `err`.
    pub fn fail_updates_with(&self, err: FlagError) {
        if let Ok(mut slot) = lock(&self.update_failure) {
            *slot = Some(err);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut slot) = lock(&self.lookup_failure) {
            *slot = None;
        }
        if let Ok(mut slot) = lock(&self.update_failure) {
            *slot = None;
        }
    }
}

#[async_trait]
impl FlagRepository for InMemoryFlagRepository {
    async fn find_by_key_or_id(&self, reference: &str) -> Result<Option<Flag>, FlagError> {
        if let Some(err) = lock(&self.lookup_failure)?.clone() {
            return Err(err);
        }

        let flags = lock(&self.flags)?;
        let by_id = reference.parse::<FlagId>().ok().and_then(|id| flags.get(&id));
        Ok(by_id
            .or_else(|| flags.values().find(|f| f.key == reference))
            .cloned())
    }

    async fn apply_update(&self, flag: &Flag, updates: &FlagUpdates) -> Result<FlagState, FlagError> {
        if let Some(err) = lock(&self.update_failure)?.clone() {
            return Err(err);
        }

        let enabled = match updates.get("enabled") {
            Some(value) => Some(
                value
                    .as_bool()
                    .ok_or_else(|| FlagError::update("enabled must be a boolean"))?,
            ),
            None => None,
        };
        let rollout = match updates.get("rolloutPercentage") {
            Some(value) => Some(
                value
                    .as_i64()
                    .filter(|p| (0..=100).contains(p))
                    .ok_or_else(|| FlagError::update("rolloutPercentage must be between 0 and 100"))?
                    as i32,
            ),
            None => None,
        };

        let mut flags = lock(&self.flags)?;
        let stored = flags
            .get_mut(&flag.id)
            .ok_or_else(|| FlagError::update("NOT_FOUND"))?;
        if let Some(enabled) = enabled {
            stored.enabled = enabled;
        }
        if let Some(rollout) = rollout {
            stored.rollout_percentage = rollout;
        }

        Ok(stored.state())
    }
}

/// In-memory flag cache keyed by flag key.
#[derive(Debug, Default)]
pub struct InMemoryFlagCache {
    entries: Mutex<HashMap<String, FlagState>>,
    invalidations: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl InMemoryFlagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, flag_key: impl Into<String>, state: FlagState) {
        if let Ok(mut entries) = lock(&self.entries) {
            entries.insert(flag_key.into(), state);
        }
    }

    pub fn get(&self, flag_key: &str) -> Option<FlagState> {
        lock(&self.entries).ok()?.get(flag_key).copied()
    }

    /// Keys passed to `invalidate`, in call order.
    pub fn invalidations(&self) -> Vec<String> {
        lock(&self.invalidations)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlagCache for InMemoryFlagCache {
    async fn invalidate(&self, flag_key: &str) -> Result<(), FlagError> {
        lock(&self.invalidations)?.push(flag_key.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(FlagError::backend("cache unavailable"));
        }
        lock(&self.entries)?.remove(flag_key);
        Ok(())
    }
}
