//! Schedule storage: fenced claims and outcome write-back.
//!
//! A claim stamps every row of a batch with one [`ClaimToken`] and a lease
//! (`claimed_until`). The holder keeps the lease alive with `renew_claim`,
//! re-checks ownership with `confirm_claim` before touching the flag, and
//! every write-back is conditional on the token. A run whose lease lapsed and
//! whose rows were re-claimed elsewhere gets `ClaimLost` instead of
//! overwriting the new owner's outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use flagsched_core::{ScheduleId, ScheduledChange};

/// Default claim lease, in seconds.
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

/// Fencing token shared by the rows of one claimed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Schedules claimed by one `claim_due` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedBatch {
    pub token: ClaimToken,
    /// How long the claim stays exclusive without a renewal.
    pub lease: Duration,
    pub schedules: Vec<ScheduledChange>,
}

impl ClaimedBatch {
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }
}

/// Schedule store abstraction.
///
/// Implementations must make `claim_due` atomic: two concurrent callers never
/// receive the same row, and rows claimed elsewhere are skipped rather than
/// waited on.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Claim up to `limit` due schedules for this invocation.
    ///
    /// Due means: status is pending (or failed with a retry scheduled),
    /// `scheduled_at <= now`, `next_retry_at` absent or `<= now`, and no live
    /// claim held by another invocation.
    async fn claim_due(&self, limit: usize) -> Result<ClaimedBatch, ScheduleStoreError>;

    /// Extend the lease of every row still held under `token`.
    ///
    /// Returns the number of rows renewed.
    async fn renew_claim(&self, token: ClaimToken) -> Result<u64, ScheduleStoreError>;

    /// Whether `token` still owns the schedule; extends its lease if so.
    async fn confirm_claim(&self, id: ScheduleId, token: ClaimToken) -> Result<bool, ScheduleStoreError>;

    /// Mark a schedule applied. Retry fields are not touched. Releases the claim.
    async fn mark_applied(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        applied_at: DateTime<Utc>,
    ) -> Result<(), ScheduleStoreError>;

    /// Mark an attempt failed, writing the retry fields verbatim.
    ///
    /// `next_retry_at = None` records a permanent failure. Releases the claim.
    async fn mark_retry(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<(), ScheduleStoreError>;
}

/// Schedule store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleStoreError {
    #[error("schedule not found: {0}")]
    NotFound(ScheduleId),
    #[error("schedule already exists: {0}")]
    AlreadyExists(ScheduleId),
    #[error("claim on schedule {0} is no longer held")]
    ClaimLost(ScheduleId),
    #[error("constraint violated: {0}")]
    Conflict(String),
    #[error("{0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    token: ClaimToken,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredSchedule {
    schedule: ScheduledChange,
    claim: Option<Claim>,
}

impl StoredSchedule {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_due(now) && self.claim.is_none_or(|c| c.until <= now)
    }

    fn held_by(&self, token: ClaimToken) -> bool {
        self.claim.is_some_and(|c| c.token == token)
    }
}

/// In-memory schedule store for tests/dev.
///
/// The whole claim runs under one lock, which gives the same partitioning
/// guarantee as `FOR UPDATE SKIP LOCKED` in the Postgres store.
#[derive(Debug)]
pub struct InMemoryScheduleStore {
    rows: Mutex<HashMap<ScheduleId, StoredSchedule>>,
    lease: Duration,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Override how long a claim stays exclusive.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Seed a schedule (schedules are created outside the job).
    pub fn insert(&self, schedule: ScheduledChange) -> Result<ScheduleId, ScheduleStoreError> {
        schedule
            .validate()
            .map_err(|e| ScheduleStoreError::Conflict(e.to_string()))?;
        let mut rows = self.lock()?;
        let id = schedule.id;
        if rows.contains_key(&id) {
            return Err(ScheduleStoreError::AlreadyExists(id));
        }
        rows.insert(id, StoredSchedule { schedule, claim: None });
        Ok(id)
    }

    /// Overwrite a stored schedule and drop any claim on it.
    pub fn update(&self, schedule: &ScheduledChange) -> Result<(), ScheduleStoreError> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(&schedule.id)
            .ok_or(ScheduleStoreError::NotFound(schedule.id))?;
        row.schedule = schedule.clone();
        row.claim = None;
        Ok(())
    }

    pub fn get(&self, id: ScheduleId) -> Option<ScheduledChange> {
        self.lock().ok()?.get(&id).map(|r| r.schedule.clone())
    }

    /// Whether a live claim is held on the schedule.
    pub fn is_claimed(&self, id: ScheduleId) -> bool {
        let now = Utc::now();
        self.lock()
            .ok()
            .and_then(|rows| rows.get(&id).and_then(|r| r.claim))
            .is_some_and(|c| c.until > now)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ScheduleId, StoredSchedule>>, ScheduleStoreError> {
        self.rows
            .lock()
            .map_err(|_| ScheduleStoreError::Storage("schedule store lock poisoned".to_string()))
    }

    fn write_back<F>(&self, id: ScheduleId, token: ClaimToken, apply: F) -> Result<(), ScheduleStoreError>
    where
        F: FnOnce(&mut ScheduledChange),
    {
        let mut rows = self.lock()?;
        let row = rows.get_mut(&id).ok_or(ScheduleStoreError::NotFound(id))?;
        if !row.held_by(token) {
            return Err(ScheduleStoreError::ClaimLost(id));
        }
        apply(&mut row.schedule);
        row.claim = None;
        Ok(())
    }
}

impl Default for InMemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn claim_due(&self, limit: usize) -> Result<ClaimedBatch, ScheduleStoreError> {
        let now = Utc::now();
        let mut rows = self.lock()?;

        // Oldest scheduled first, id as tie-breaker for a stable order.
        let mut due: Vec<_> = rows
            .values()
            .filter(|r| r.is_claimable(now))
            .map(|r| (r.schedule.scheduled_at, r.schedule.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let claim = Claim {
            token: ClaimToken::new(),
            until: now + self.lease,
        };
        let mut schedules = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(row) = rows.get_mut(&id) {
                row.claim = Some(claim);
                schedules.push(row.schedule.clone());
            }
        }

        Ok(ClaimedBatch {
            token: claim.token,
            lease: self.lease,
            schedules,
        })
    }

    async fn renew_claim(&self, token: ClaimToken) -> Result<u64, ScheduleStoreError> {
        let until = Utc::now() + self.lease;
        let mut rows = self.lock()?;
        let mut renewed = 0;
        for row in rows.values_mut().filter(|r| r.held_by(token)) {
            row.claim = Some(Claim { token, until });
            renewed += 1;
        }
        Ok(renewed)
    }

    async fn confirm_claim(&self, id: ScheduleId, token: ClaimToken) -> Result<bool, ScheduleStoreError> {
        let until = Utc::now() + self.lease;
        let mut rows = self.lock()?;
        let row = rows.get_mut(&id).ok_or(ScheduleStoreError::NotFound(id))?;
        if !row.held_by(token) {
            return Ok(false);
        }
        row.claim = Some(Claim { token, until });
        Ok(true)
    }

    async fn mark_applied(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        applied_at: DateTime<Utc>,
    ) -> Result<(), ScheduleStoreError> {
        self.write_back(id, token, |s| s.mark_applied(applied_at))
    }

    async fn mark_retry(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<(), ScheduleStoreError> {
        self.write_back(id, token, |s| s.mark_retry(retry_count, next_retry_at, last_error))
    }
}

#[async_trait]
impl<S> ScheduleStore for Arc<S>
where
    S: ScheduleStore + ?Sized,
{
    async fn claim_due(&self, limit: usize) -> Result<ClaimedBatch, ScheduleStoreError> {
        (**self).claim_due(limit).await
    }

    async fn renew_claim(&self, token: ClaimToken) -> Result<u64, ScheduleStoreError> {
        (**self).renew_claim(token).await
    }

    async fn confirm_claim(&self, id: ScheduleId, token: ClaimToken) -> Result<bool, ScheduleStoreError> {
        (**self).confirm_claim(id, token).await
    }

    async fn mark_applied(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        applied_at: DateTime<Utc>,
    ) -> Result<(), ScheduleStoreError> {
        (**self).mark_applied(id, token, applied_at).await
    }

    async fn mark_retry(
        &self,
        id: ScheduleId,
        token: ClaimToken,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<(), ScheduleStoreError> {
        (**self)
            .mark_retry(id, token, retry_count, next_retry_at, last_error)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use flagsched_core::{FlagId, FlagUpdates, ScheduleStatus};
    use proptest::prelude::*;

    use super::*;

    fn due_schedule() -> ScheduledChange {
        ScheduledChange::new(
            FlagId::new(),
            FlagUpdates::new().with("enabled", true),
            Utc::now() - Duration::minutes(1),
        )
    }

    fn ids(batch: &ClaimedBatch) -> Vec<ScheduleId> {
        batch.schedules.iter().map(|s| s.id).collect()
    }

    #[tokio::test]
    async fn claim_returns_due_rows_and_skips_them_afterwards() {
        let store = InMemoryScheduleStore::new();
        let id = store.insert(due_schedule()).unwrap();

        let batch = store.claim_due(10).await.unwrap();
        assert_eq!(ids(&batch), vec![id]);
        assert_eq!(batch.lease, Duration::seconds(DEFAULT_CLAIM_LEASE_SECS));
        assert!(store.is_claimed(id));

        // Still claimed: a second invocation sees nothing.
        assert!(store.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_order() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let mut seeded = Vec::new();
        for minutes in [30, 20, 10] {
            let s = ScheduledChange::new(FlagId::new(), FlagUpdates::new(), now - Duration::minutes(minutes));
            seeded.push(store.insert(s).unwrap());
        }

        let first = store.claim_due(2).await.unwrap();
        assert_eq!(ids(&first), seeded[..2].to_vec());

        let rest = store.claim_due(2).await.unwrap();
        assert_eq!(ids(&rest), vec![seeded[2]]);
        assert_ne!(first.token, rest.token);
    }

    #[tokio::test]
    async fn claim_ignores_rows_that_are_not_due() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();

        let future = ScheduledChange::new(FlagId::new(), FlagUpdates::new(), now + Duration::hours(1));
        store.insert(future).unwrap();

        let mut waiting = due_schedule();
        waiting.mark_retry(1, Some(now + Duration::minutes(2)), "Flag update failed: DB_ERROR");
        store.insert(waiting).unwrap();

        let mut dead = due_schedule();
        dead.mark_retry(3, None, "Flag update failed: DB_ERROR");
        store.insert(dead).unwrap();

        let mut applied = due_schedule();
        applied.mark_applied(now);
        store.insert(applied).unwrap();

        assert!(store.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_row_with_elapsed_retry_is_claimable() {
        let store = InMemoryScheduleStore::new();
        let mut s = due_schedule();
        s.mark_retry(1, Some(Utc::now() - Duration::seconds(1)), "Flag update failed: DB_ERROR");
        let id = store.insert(s).unwrap();

        let batch = store.claim_due(10).await.unwrap();
        assert_eq!(ids(&batch), vec![id]);
        assert_eq!(batch.schedules[0].status, ScheduleStatus::Failed);
    }

    #[tokio::test]
    async fn write_back_releases_the_claim() {
        let store = InMemoryScheduleStore::new();
        let id = store.insert(due_schedule()).unwrap();
        let batch = store.claim_due(1).await.unwrap();

        let retry_at = Utc::now() - Duration::seconds(1);
        store.mark_retry(id, batch.token, 1, Some(retry_at), "boom").await.unwrap();
        assert!(!store.is_claimed(id));

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, ScheduleStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.next_retry_at, Some(retry_at));
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        // Retry time already elapsed, so the next invocation picks it up.
        assert_eq!(store.claim_due(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_applied_leaves_retry_fields_alone() {
        let store = InMemoryScheduleStore::new();
        let mut s = due_schedule();
        s.mark_retry(2, Some(Utc::now() - Duration::seconds(1)), "earlier failure");
        let id = store.insert(s).unwrap();
        let batch = store.claim_due(1).await.unwrap();

        let applied_at = Utc::now();
        store.mark_applied(id, batch.token, applied_at).await.unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, ScheduleStatus::Applied);
        assert_eq!(stored.applied_at, Some(applied_at));
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("earlier failure"));
    }

    #[tokio::test]
    async fn expired_lease_makes_row_claimable_again() {
        let store = InMemoryScheduleStore::new().with_lease(Duration::zero());
        let id = store.insert(due_schedule()).unwrap();

        assert_eq!(ids(&store.claim_due(1).await.unwrap()), vec![id]);
        assert_eq!(ids(&store.claim_due(1).await.unwrap()), vec![id]);
    }

    #[tokio::test]
    async fn stale_token_cannot_write_back_after_reclaim() {
        let store = InMemoryScheduleStore::new().with_lease(Duration::zero());
        let id = store.insert(due_schedule()).unwrap();

        let stale = store.claim_due(1).await.unwrap();
        let current = store.claim_due(1).await.unwrap();
        assert_eq!(ids(&current), vec![id]);

        assert!(!store.confirm_claim(id, stale.token).await.unwrap());
        assert_eq!(
            store.mark_applied(id, stale.token, Utc::now()).await,
            Err(ScheduleStoreError::ClaimLost(id))
        );
        assert_eq!(
            store.mark_retry(id, stale.token, 1, None, "boom").await,
            Err(ScheduleStoreError::ClaimLost(id))
        );
        assert_eq!(store.get(id).unwrap().status, ScheduleStatus::Pending);

        assert!(store.confirm_claim(id, current.token).await.unwrap());
        store.mark_applied(id, current.token, Utc::now()).await.unwrap();
        assert_eq!(store.get(id).unwrap().status, ScheduleStatus::Applied);
    }

    #[tokio::test]
    async fn renewal_keeps_rows_out_of_other_claims() {
        let store = InMemoryScheduleStore::new().with_lease(Duration::milliseconds(200));
        let id = store.insert(due_schedule()).unwrap();
        let batch = store.claim_due(1).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(store.renew_claim(batch.token).await.unwrap(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        // Past the original lease, but within the renewed one.
        assert!(store.is_claimed(id));
        assert!(store.claim_due(1).await.unwrap().is_empty());

        store.mark_applied(id, batch.token, Utc::now()).await.unwrap();
        assert_eq!(store.renew_claim(batch.token).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_back_to_unknown_schedule_fails() {
        let store = InMemoryScheduleStore::new();
        let id = ScheduleId::new();
        assert_eq!(
            store.mark_applied(id, ClaimToken::new(), Utc::now()).await,
            Err(ScheduleStoreError::NotFound(id))
        );
    }

    #[test]
    fn insert_rejects_retry_count_above_ceiling() {
        let store = InMemoryScheduleStore::new();
        let mut s = due_schedule();
        s.mark_retry(4, None, "boom");
        assert!(matches!(store.insert(s), Err(ScheduleStoreError::Conflict(_))));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryScheduleStore::new();
        let s = due_schedule();
        store.insert(s.clone()).unwrap();
        assert_eq!(store.insert(s.clone()), Err(ScheduleStoreError::AlreadyExists(s.id)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // N concurrent claims of limit L against M due rows partition the set.
        #[test]
        fn concurrent_claims_never_overlap(rows in 1usize..60, claimers in 2usize..8, limit in 1usize..20) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();

            let claimed = runtime.block_on(async {
                let store = InMemoryScheduleStore::arc();
                for _ in 0..rows {
                    store.insert(due_schedule()).unwrap();
                }

                let handles: Vec<_> = (0..claimers)
                    .map(|_| {
                        let store = store.clone();
                        tokio::spawn(async move { store.claim_due(limit).await })
                    })
                    .collect();

                let mut all = Vec::new();
                for handle in handles {
                    all.extend(handle.await.unwrap().unwrap().schedules);
                }
                all
            });

            let unique: HashSet<_> = claimed.iter().map(|s| s.id).collect();
            prop_assert_eq!(unique.len(), claimed.len());
            prop_assert!(claimed.len() <= rows);
            prop_assert_eq!(claimed.len(), rows.min(claimers * limit));
        }
    }
}
