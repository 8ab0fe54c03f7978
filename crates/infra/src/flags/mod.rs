//! Feature-flag collaborators of the schedule job.
//!
//! The flag store and its cache are owned elsewhere; the job only needs to
//! resolve a flag, apply an opaque update to it and invalidate its cache entry.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;

use flagsched_core::{Flag, FlagState, FlagUpdates};

pub use in_memory::{InMemoryFlagCache, InMemoryFlagRepository};
pub use postgres::PostgresFlagRepository;

/// Flag lookup and mutation.
#[async_trait]
pub trait FlagRepository: Send + Sync {
    /// Resolve a flag by its key or by its id.
    async fn find_by_key_or_id(&self, reference: &str) -> Result<Option<Flag>, FlagError>;

    /// Apply `updates` to `flag`, returning the post-update state.
    async fn apply_update(&self, flag: &Flag, updates: &FlagUpdates) -> Result<FlagState, FlagError>;
}

/// Flag cache invalidation. Callers treat failures as non-fatal.
#[async_trait]
pub trait FlagCache: Send + Sync {
    async fn invalidate(&self, flag_key: &str) -> Result<(), FlagError>;
}

/// Flag collaborator error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagError {
    /// The flag store rejected the update (business failure).
    #[error("{0}")]
    Update(String),
    /// The flag store (or cache) could not be reached.
    #[error("{0}")]
    Backend(String),
}

impl FlagError {
    pub fn update(reason: impl Into<String>) -> Self {
        Self::Update(reason.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
