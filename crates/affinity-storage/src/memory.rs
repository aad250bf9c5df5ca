//! In-memory record and profile stores.
//!
//! Used by tests and benchmarks. Both stores can be switched "offline" to
//! exercise the `StoreUnavailable` paths of the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{
    EmbeddingRecord, EmbeddingType, OwnerId, OwnerProfile, Preference, RecordFilter,
};

use crate::store::{ProfileStore, RecordStore, StoreScan};

/// Record store backed by a `Vec` behind a lock.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<EmbeddingRecord>>,
    epoch: AtomicU64,
    offline: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AffinityError::StoreUnavailable(
                "record store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AffinityError {
    AffinityError::StoreUnavailable(format!("store lock poisoned: {}", e))
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append(&self, records: &[EmbeddingRecord]) -> Result<()> {
        self.check_available()?;
        let mut guard = self.records.write().map_err(poisoned)?;
        guard.extend_from_slice(records);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(count = records.len(), "Appended records");
        Ok(())
    }

    async fn delete_by_key(
        &self,
        owner_id: OwnerId,
        embedding_type: &EmbeddingType,
    ) -> Result<usize> {
        self.check_available()?;
        let mut guard = self.records.write().map_err(poisoned)?;
        let before = guard.len();
        guard.retain(|r| !(r.owner_id == owner_id && &r.embedding_type == embedding_type));
        let removed = before - guard.len();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }

    async fn scan(&self, filter: &RecordFilter) -> Result<StoreScan> {
        self.check_available()?;
        let guard = self.records.read().map_err(poisoned)?;
        let records = guard.iter().filter(|r| filter.matches(r)).cloned().collect();
        Ok(StoreScan {
            records,
            skipped: 0,
            epoch: self.epoch.load(Ordering::SeqCst),
        })
    }

    async fn epoch(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.epoch.load(Ordering::SeqCst))
    }
}

/// Profile store backed by a map of owner id to profile and preference.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<OwnerId, (OwnerProfile, Preference)>>,
    offline: AtomicBool,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an owner's profile and preference.
    pub fn upsert(&self, profile: OwnerProfile, preference: Preference) -> Result<()> {
        let mut guard = self.profiles.write().map_err(poisoned)?;
        guard.insert(profile.owner_id, (profile, preference));
        Ok(())
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AffinityError::StoreUnavailable(
                "profile store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_preference(&self, owner_id: OwnerId) -> Result<Preference> {
        self.check_available()?;
        let guard = self.profiles.read().map_err(poisoned)?;
        guard
            .get(&owner_id)
            .map(|(_, pref)| pref.clone())
            .ok_or_else(|| AffinityError::InvalidInput(format!("unknown owner {}", owner_id)))
    }

    async fn list_eligible_owners(&self, predicate: &Preference) -> Result<Vec<OwnerProfile>> {
        self.check_available()?;
        let guard = self.profiles.read().map_err(poisoned)?;
        let mut eligible: Vec<OwnerProfile> = guard
            .values()
            .filter(|(profile, _)| predicate.admits(profile))
            .map(|(profile, _)| profile.clone())
            .collect();
        eligible.sort_by_key(|p| p.owner_id);
        Ok(eligible)
    }
}
