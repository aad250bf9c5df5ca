//! Collaborator contracts for persisted embedding records and owner profiles.
//!
//! The matching engine never talks to a storage engine directly. It reads and
//! writes through these two traits, which have an in-memory implementation
//! (tests, benchmarks) and a SQLite implementation (the `affinity` binary).

use std::sync::Arc;

use async_trait::async_trait;

use affinity_core::error::Result;
use affinity_core::types::{
    EmbeddingRecord, EmbeddingType, OwnerId, OwnerProfile, Preference, RecordFilter,
};

/// Result of a bulk scan.
#[derive(Debug, Clone, Default)]
pub struct StoreScan {
    /// Records that parsed into a vector of the store's dimension.
    pub records: Vec<EmbeddingRecord>,
    /// Rows skipped because their stored vector was malformed or had the
    /// wrong dimension.
    pub skipped: usize,
    /// Store epoch the scan was taken at.
    pub epoch: u64,
}

/// Append/delete/scan interface over persisted embedding records.
///
/// Every mutation advances [`epoch`](RecordStore::epoch) by one.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist new records.
    async fn append(&self, records: &[EmbeddingRecord]) -> Result<()>;

    /// Delete every record stored under `(owner_id, embedding_type)`.
    /// Returns the number of rows removed.
    async fn delete_by_key(&self, owner_id: OwnerId, embedding_type: &EmbeddingType)
        -> Result<usize>;

    /// Return every record matching `filter`.
    async fn scan(&self, filter: &RecordFilter) -> Result<StoreScan>;

    /// Monotonic mutation counter.
    async fn epoch(&self) -> Result<u64>;
}

/// Source of owner profiles and matching preferences.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Preference of a requester. Unknown owners are an `InvalidInput` error.
    async fn get_preference(&self, owner_id: OwnerId) -> Result<Preference>;

    /// Every owner the predicate admits, with their profile summary.
    async fn list_eligible_owners(&self, predicate: &Preference) -> Result<Vec<OwnerProfile>>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn append(&self, records: &[EmbeddingRecord]) -> Result<()> {
        (**self).append(records).await
    }

    async fn delete_by_key(
        &self,
        owner_id: OwnerId,
        embedding_type: &EmbeddingType,
    ) -> Result<usize> {
        (**self).delete_by_key(owner_id, embedding_type).await
    }

    async fn scan(&self, filter: &RecordFilter) -> Result<StoreScan> {
        (**self).scan(filter).await
    }

    async fn epoch(&self) -> Result<u64> {
        (**self).epoch().await
    }
}

#[async_trait]
impl<T: ProfileStore + ?Sized> ProfileStore for Arc<T> {
    async fn get_preference(&self, owner_id: OwnerId) -> Result<Preference> {
        (**self).get_preference(owner_id).await
    }

    async fn list_eligible_owners(&self, predicate: &Preference) -> Result<Vec<OwnerProfile>> {
        (**self).list_eligible_owners(predicate).await
    }
}
