use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{ScheduleState, StateStoreError, StoredSource};
use crate::feed::{CacheHints, EntryIdentity};

/// Durable per-source dedup and schedule state.
///
/// Implementations synchronize internally; callers never hold a lock around
/// these calls. State is partitioned by source id and a `mark_seen` is
/// visible to every later `has_seen` on the same store.
///
/// # Errors
///
/// Every method returns [`StateStoreError`]. The engine treats any of them
/// as a failed poll of the source involved (`ErrorKind::Storage`) and keeps
/// polling the others.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Register a configured source and return its persisted state.
    ///
    /// # Arguments
    ///
    /// * `id` - Stable source identifier; dedup state is keyed on it
    /// * `url` - Current feed URL, updated in place if it changed
    /// * `enabled` - Whether the source is scheduled
    ///
    /// # Returns
    ///
    /// The stored schedule and cache hints, or defaults for a new source.
    async fn register_source(
        &self,
        id: &str,
        url: &str,
        enabled: bool,
    ) -> Result<StoredSource, StateStoreError>;

    /// Whether `identity` was recorded for its source
    async fn has_seen(&self, identity: &EntryIdentity) -> Result<bool, StateStoreError>;

    /// Idempotent: marking an already-seen identity changes nothing
    async fn mark_seen(
        &self,
        identity: &EntryIdentity,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError>;

    /// Record that already-seen identities are still present in the source
    async fn touch_seen(
        &self,
        source_id: &str,
        identities: &[String],
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError>;

    /// Remove identities observed strictly before `cutoff`.
    ///
    /// # Returns
    ///
    /// The number of identities removed.
    async fn prune_older_than(
        &self,
        source_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StateStoreError>;

    /// Count-based retention: keep the `keep` most recently observed
    /// identities (ties at the boundary are kept)
    async fn enforce_retention(&self, source_id: &str, keep: usize)
        -> Result<u64, StateStoreError>;

    /// Persist the schedule and cache hints that a restart resumes from.
    ///
    /// # Errors
    ///
    /// [`StateStoreError::UnknownSource`] if `source_id` was never registered.
    async fn save_schedule(
        &self,
        source_id: &str,
        schedule: &ScheduleState,
        hints: &CacheHints,
    ) -> Result<(), StateStoreError>;
}

#[async_trait]
impl StateStore for Database {
    async fn register_source(
        &self,
        id: &str,
        url: &str,
        enabled: bool,
    ) -> Result<StoredSource, StateStoreError> {
        self.upsert_source(id, url, enabled).await
    }

    async fn has_seen(&self, identity: &EntryIdentity) -> Result<bool, StateStoreError> {
        self.is_seen(&identity.source_id, &identity.body).await
    }

    async fn mark_seen(
        &self,
        identity: &EntryIdentity,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        self.insert_seen(&identity.source_id, &identity.body, observed_at)
            .await
    }

    async fn touch_seen(
        &self,
        source_id: &str,
        identities: &[String],
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        self.refresh_seen(source_id, identities, observed_at).await
    }

    async fn prune_older_than(
        &self,
        source_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StateStoreError> {
        self.delete_seen_before(source_id, cutoff).await
    }

    async fn enforce_retention(
        &self,
        source_id: &str,
        keep: usize,
    ) -> Result<u64, StateStoreError> {
        match self.retention_cutoff(source_id, keep).await? {
            Some(cutoff) => self.delete_seen_before(source_id, cutoff).await,
            None => Ok(0),
        }
    }

    async fn save_schedule(
        &self,
        source_id: &str,
        schedule: &ScheduleState,
        hints: &CacheHints,
    ) -> Result<(), StateStoreError> {
        self.update_schedule(source_id, schedule, hints).await
    }
}
