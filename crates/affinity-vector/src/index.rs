//! Shared ANN index over embedding records.
//!
//! [`IndexHandle`] owns the HNSW graph behind a read-mostly lock and manages
//! its lifecycle:
//!
//! - `init` bulk-loads from the record store. Until it completes every search
//!   fails with `IndexUnavailable`.
//! - `replace` / `append` / `retire_owner` apply incremental changes. Entries
//!   of a replaced key are marked invalid, never physically removed.
//! - `rebuild` builds a fresh graph from the store off to the side, replays
//!   the changes that landed meanwhile, and swaps it in. This compacts away
//!   invalid entries.
//! - `teardown` drops the graph.
//!
//! The index is a point-in-time projection of the record store: it records
//! the store epoch of the snapshot it was built from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use affinity_core::config::IndexConfig;
use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{
    similarity_score, AgentId, EmbeddingRecord, EmbeddingType, OwnerId, Preference, RecordFilter,
    RecordId, RecordKey, Vector,
};
use affinity_storage::{ProfileStore, RecordStore};

use crate::hnsw::{exact_search, knn_search_filtered, HnswConfig, HnswGraph};

/// Graphs this small are searched exhaustively.
const EXACT_SCAN_LIMIT: usize = 256;

/// Index-side view of a record: everything but the vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedRecord {
    pub record_id: RecordId,
    pub owner_id: OwnerId,
    pub agent_id: Option<AgentId>,
    pub embedding_type: EmbeddingType,
    pub data_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&EmbeddingRecord> for IndexedRecord {
    fn from(record: &EmbeddingRecord) -> Self {
        Self {
            record_id: record.id,
            owner_id: record.owner_id,
            agent_id: record.agent_id.clone(),
            embedding_type: record.embedding_type.clone(),
            data_type: record.data_type.clone(),
            created_at: record.created_at,
        }
    }
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    /// Similarity mapped to `[0, 1]`.
    pub score: f64,
    /// Raw inner product (cosine) in `[-1, 1]`.
    pub inner_product: f32,
    pub record: Arc<IndexedRecord>,
}

/// Point-in-time index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndexStats {
    pub live: usize,
    pub stale: usize,
    pub total: usize,
    pub snapshot_epoch: u64,
    pub searches: u64,
    pub max_layer: usize,
    pub compaction_recommended: bool,
}

/// A mutation applied to the live graph and, during a rebuild, replayed into
/// the replacement.
#[derive(Debug, Clone)]
enum IndexChange {
    Replace {
        key: RecordKey,
        records: Vec<EmbeddingRecord>,
    },
    Append(Vec<EmbeddingRecord>),
    RetireOwner(OwnerId),
}

/// The graph plus its position-to-record mapping.
#[derive(Debug)]
struct AnnIndex {
    graph: HnswGraph,
    entries: Vec<Arc<IndexedRecord>>,
    by_key: HashMap<RecordKey, Vec<u32>>,
    by_record: HashMap<RecordId, u32>,
    live: usize,
    snapshot_epoch: u64,
}

impl AnnIndex {
    fn new(dimension: usize, config: HnswConfig, snapshot_epoch: u64) -> Self {
        Self {
            graph: HnswGraph::new(dimension, config),
            entries: Vec::new(),
            by_key: HashMap::new(),
            by_record: HashMap::new(),
            live: 0,
            snapshot_epoch,
        }
    }

    /// Insert a record unless a valid entry for the same record id exists.
    fn add(&mut self, record: &EmbeddingRecord) -> Option<u32> {
        if let Some(&existing) = self.by_record.get(&record.id) {
            if self.graph.is_valid(existing) {
                return None;
            }
        }
        let id = self.graph.insert(record.vector.as_slice());
        self.entries.push(Arc::new(IndexedRecord::from(record)));
        self.by_key.entry(record.key()).or_default().push(id);
        self.by_record.insert(record.id, id);
        self.live += 1;
        Some(id)
    }

    fn invalidate_key(&mut self, key: &RecordKey) -> usize {
        let Some(ids) = self.by_key.remove(key) else {
            return 0;
        };
        let removed = ids.into_iter().filter(|&id| self.graph.invalidate(id)).count();
        self.live -= removed;
        removed
    }

    fn retire_owner(&mut self, owner_id: OwnerId) -> usize {
        let keys: Vec<RecordKey> = self
            .by_key
            .keys()
            .filter(|k| k.owner_id == owner_id)
            .cloned()
            .collect();
        keys.iter().map(|k| self.invalidate_key(k)).sum()
    }

    fn apply(&mut self, change: &IndexChange) {
        match change {
            IndexChange::Replace { key, records } => {
                let invalidated = self.invalidate_key(key);
                let added = records.iter().filter_map(|r| self.add(r)).count();
                debug!(owner_id = %key.owner_id, embedding_type = %key.embedding_type, invalidated, added, "Replaced index entries");
            }
            IndexChange::Append(records) => {
                for record in records {
                    self.add(record);
                }
            }
            IndexChange::RetireOwner(owner_id) => {
                let invalidated = self.retire_owner(*owner_id);
                debug!(owner_id = %owner_id, invalidated, "Retired owner from index");
            }
        }
    }

    fn search<F: Fn(&IndexedRecord) -> bool>(
        &self,
        query: &[f32],
        k: usize,
        filter: F,
    ) -> Vec<(f32, u32)> {
        let accept = |id: u32| filter(&self.entries[id as usize]);
        if self.graph.node_count() <= EXACT_SCAN_LIMIT || k >= self.live {
            exact_search(&self.graph, query, k, &accept)
        } else {
            knn_search_filtered(&self.graph, query, k, &accept)
        }
    }

    fn stats(&self, searches: u64, stale_ratio: f64) -> IndexStats {
        let total = self.graph.node_count();
        let stale = total - self.live;
        IndexStats {
            live: self.live,
            stale,
            total,
            snapshot_epoch: self.snapshot_epoch,
            searches,
            max_layer: self.graph.max_layer(),
            compaction_recommended: total > 0 && stale as f64 / total as f64 > stale_ratio,
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AffinityError {
    AffinityError::IndexUnavailable(format!("index lock poisoned: {}", e))
}

/// Explicit handle to the shared ANN index, constructed at startup and
/// injected into the ingestion pipeline and the match engine.
pub struct IndexHandle {
    config: IndexConfig,
    dimension: usize,
    state: RwLock<Option<AnnIndex>>,
    /// `Some` while a bulk load is in flight; collects changes to replay.
    pending: Mutex<Option<Vec<IndexChange>>>,
    searches: AtomicU64,
    compaction_flagged: AtomicBool,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("dimension", &self.dimension)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl IndexHandle {
    pub fn new(config: &IndexConfig, dimension: usize) -> Self {
        Self {
            config: config.clone(),
            dimension,
            state: RwLock::new(None),
            pending: Mutex::new(None),
            searches: AtomicU64::new(0),
            compaction_flagged: AtomicBool::new(false),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether a graph is loaded and searches are accepted.
    pub fn is_ready(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Bulk-load the index from the record store.
    pub async fn init(
        &self,
        records: &dyn RecordStore,
        profiles: &dyn ProfileStore,
    ) -> Result<IndexStats> {
        info!(dimension = self.dimension, "Loading index from record store");
        self.load(records, profiles).await
    }

    /// Rebuild from the record store and swap the new graph in, dropping
    /// invalid entries. Searches keep using the old graph meanwhile.
    pub async fn rebuild(
        &self,
        records: &dyn RecordStore,
        profiles: &dyn ProfileStore,
    ) -> Result<IndexStats> {
        info!("Rebuilding index");
        self.load(records, profiles).await
    }

    /// Drop the graph. Searches fail with `IndexUnavailable` until the next
    /// `init`.
    pub fn teardown(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        *state = None;
        info!("Index torn down");
        Ok(())
    }

    async fn load(
        &self,
        records: &dyn RecordStore,
        profiles: &dyn ProfileStore,
    ) -> Result<IndexStats> {
        {
            let mut pending = self.pending.lock().map_err(poisoned)?;
            if pending.is_some() {
                return Err(AffinityError::IndexUnavailable(
                    "index load already in progress".to_string(),
                ));
            }
            *pending = Some(Vec::new());
        }

        let built = self.build_snapshot(records, profiles).await;

        let mut pending = self.pending.lock().map_err(poisoned)?;
        let changes = pending.take().unwrap_or_default();
        let mut fresh = built?;

        let mut state = self.state.write().map_err(poisoned)?;
        for change in &changes {
            fresh.apply(change);
        }
        let stats = fresh.stats(
            self.searches.load(Ordering::Relaxed),
            self.config.compaction_stale_ratio,
        );
        *state = Some(fresh);
        drop(state);
        drop(pending);
        self.compaction_flagged.store(false, Ordering::Relaxed);

        info!(
            live = stats.live,
            replayed = changes.len(),
            epoch = stats.snapshot_epoch,
            "Index loaded"
        );
        Ok(stats)
    }

    async fn build_snapshot(
        &self,
        records: &dyn RecordStore,
        profiles: &dyn ProfileStore,
    ) -> Result<AnnIndex> {
        let filter = if self.config.verified_only_bulk_load {
            let verified = Preference {
                require_verified: true,
                ..Preference::allow_all()
            };
            let owners = profiles.list_eligible_owners(&verified).await?;
            RecordFilter::for_owners(owners.into_iter().map(|p| p.owner_id))
        } else {
            RecordFilter::all()
        };

        let scan = records.scan(&filter).await?;
        if scan.skipped > 0 {
            warn!(skipped = scan.skipped, "Skipped malformed records during bulk load");
        }

        let dimension = self.dimension;
        let config = HnswConfig::from(&self.config);
        tokio::task::spawn_blocking(move || {
            let mut index = AnnIndex::new(dimension, config, scan.epoch);
            for record in &scan.records {
                if record.vector.dimension() != dimension {
                    warn!(
                        record_id = %record.id,
                        expected = dimension,
                        actual = record.vector.dimension(),
                        "Skipping record with mismatched dimension"
                    );
                    continue;
                }
                index.add(record);
            }
            index
        })
        .await
        .map_err(|e| AffinityError::IndexUnavailable(format!("index build panicked: {}", e)))
    }

    /// Replace every entry of `key` with `records`.
    pub fn replace(&self, key: RecordKey, records: &[EmbeddingRecord]) -> Result<()> {
        self.check_dimensions(records)?;
        self.apply_change(IndexChange::Replace {
            key,
            records: records.to_vec(),
        })
    }

    /// Add records without touching existing entries.
    pub fn append(&self, records: &[EmbeddingRecord]) -> Result<()> {
        self.check_dimensions(records)?;
        self.apply_change(IndexChange::Append(records.to_vec()))
    }

    /// Invalidate every entry of an owner.
    pub fn retire_owner(&self, owner_id: OwnerId) -> Result<()> {
        self.apply_change(IndexChange::RetireOwner(owner_id))
    }

    fn check_dimensions(&self, records: &[EmbeddingRecord]) -> Result<()> {
        match records.iter().find(|r| r.vector.dimension() != self.dimension) {
            Some(bad) => Err(AffinityError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.vector.dimension(),
            }),
            None => Ok(()),
        }
    }

    fn apply_change(&self, change: IndexChange) -> Result<()> {
        let mut pending = self.pending.lock().map_err(poisoned)?;
        let mut state = self.state.write().map_err(poisoned)?;
        match state.as_mut() {
            Some(index) => index.apply(&change),
            None if pending.is_none() => {
                debug!("Index not loaded; change will be picked up by the next load");
            }
            None => {}
        }
        if let Some(log) = pending.as_mut() {
            log.push(change);
        }

        if let Some(stats) = self.stats_of(state.as_ref()) {
            if stats.compaction_recommended && !self.compaction_flagged.swap(true, Ordering::Relaxed)
            {
                warn!(
                    stale = stats.stale,
                    total = stats.total,
                    "Stale index entries exceed the compaction bound; rebuild recommended"
                );
            }
        }
        Ok(())
    }

    /// Up to `k` nearest valid entries, best first.
    pub fn search(&self, query: &Vector, k: usize) -> Result<Vec<ScoredRecord>> {
        self.search_filtered(query, k, |_| true)
    }

    /// Up to `k` nearest valid entries accepted by `filter`, best first.
    pub fn search_filtered<F>(&self, query: &Vector, k: usize, filter: F) -> Result<Vec<ScoredRecord>>
    where
        F: Fn(&IndexedRecord) -> bool,
    {
        if query.dimension() != self.dimension {
            return Err(AffinityError::DimensionMismatch {
                expected: self.dimension,
                actual: query.dimension(),
            });
        }
        let state = self.state.read().map_err(poisoned)?;
        let index = state
            .as_ref()
            .ok_or_else(|| AffinityError::IndexUnavailable("index is not loaded".to_string()))?;
        self.searches.fetch_add(1, Ordering::Relaxed);

        Ok(index
            .search(query.as_slice(), k, filter)
            .into_iter()
            .map(|(distance, id)| {
                let inner_product = 1.0 - distance;
                ScoredRecord {
                    score: similarity_score(inner_product),
                    inner_product,
                    record: Arc::clone(&index.entries[id as usize]),
                }
            })
            .collect())
    }

    /// Live vectors of one owner, optionally restricted to one type.
    pub fn owner_vectors(
        &self,
        owner_id: OwnerId,
        embedding_type: Option<&EmbeddingType>,
    ) -> Result<Vec<(Arc<IndexedRecord>, Vector)>> {
        let state = self.state.read().map_err(poisoned)?;
        let index = state
            .as_ref()
            .ok_or_else(|| AffinityError::IndexUnavailable("index is not loaded".to_string()))?;

        let mut out = Vec::new();
        for (key, ids) in &index.by_key {
            if key.owner_id != owner_id {
                continue;
            }
            if embedding_type.is_some_and(|t| t != &key.embedding_type) {
                continue;
            }
            for &id in ids {
                if index.graph.is_valid(id) {
                    let vector = Vector::from_values(index.graph.vector(id).to_vec(), self.dimension)?;
                    out.push((Arc::clone(&index.entries[id as usize]), vector));
                }
            }
        }
        out.sort_by_key(|(record, _)| record.created_at);
        Ok(out)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read().map_err(poisoned)?;
        self.stats_of(state.as_ref())
            .ok_or_else(|| AffinityError::IndexUnavailable("index is not loaded".to_string()))
    }

    fn stats_of(&self, index: Option<&AnnIndex>) -> Option<IndexStats> {
        index.map(|i| {
            i.stats(
                self.searches.load(Ordering::Relaxed),
                self.config.compaction_stale_ratio,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affinity_core::types::OwnerProfile;
    use affinity_storage::{MemoryProfileStore, MemoryRecordStore};

    const DIM: usize = 4;

    fn config() -> IndexConfig {
        IndexConfig {
            verified_only_bulk_load: false,
            ..Default::default()
        }
    }

    fn record(owner: OwnerId, ty: &str, values: [f32; DIM]) -> EmbeddingRecord {
        EmbeddingRecord {
            id: RecordId::new(),
            owner_id: owner,
            agent_id: None,
            vector: Vector::normalized(values.to_vec(), DIM).unwrap(),
            embedding_type: ty.parse().unwrap(),
            data_type: None,
            created_at: Utc::now(),
            source_ref: None,
        }
    }

    fn query(values: [f32; DIM]) -> Vector {
        Vector::normalized(values.to_vec(), DIM).unwrap()
    }

    async fn loaded(records: &[EmbeddingRecord]) -> IndexHandle {
        let store = MemoryRecordStore::new();
        store.append(records).await.unwrap();
        let handle = IndexHandle::new(&config(), DIM);
        handle.init(&store, &MemoryProfileStore::new()).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_search_before_init_is_unavailable() {
        let handle = IndexHandle::new(&config(), DIM);
        let err = handle.search(&query([1.0, 0.0, 0.0, 0.0]), 5).unwrap_err();
        assert!(matches!(err, AffinityError::IndexUnavailable(_)));
        assert!(err.is_retryable());
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn test_init_loads_store_and_records_epoch() {
        let a = OwnerId::new();
        let handle = loaded(&[
            record(a, "bio", [1.0, 0.0, 0.0, 0.0]),
            record(OwnerId::new(), "bio", [0.0, 1.0, 0.0, 0.0]),
        ])
        .await;

        let stats = handle.stats().unwrap();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.stale, 0);
        assert_eq!(stats.snapshot_epoch, 1);

        let hits = handle.search(&query([1.0, 0.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.owner_id, a);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_hits() {
        let handle = loaded(&[]).await;
        assert!(handle.search(&query([1.0, 1.0, 0.0, 0.0]), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_invalidates_previous_entries() {
        let owner = OwnerId::new();
        let old = record(owner, "bio", [1.0, 0.0, 0.0, 0.0]);
        let handle = loaded(std::slice::from_ref(&old)).await;

        let new = record(owner, "bio", [0.0, 0.0, 1.0, 0.0]);
        handle.replace(old.key(), std::slice::from_ref(&new)).unwrap();

        let stats = handle.stats().unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.stale, 1);
        assert!(stats.compaction_recommended);

        let hits = handle.search(&query([1.0, 0.0, 0.0, 0.0]), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.record_id, new.id);
    }

    #[tokio::test]
    async fn test_retire_owner() {
        let owner = OwnerId::new();
        let other = OwnerId::new();
        let handle = loaded(&[
            record(owner, "bio", [1.0, 0.0, 0.0, 0.0]),
            record(owner, "image", [0.0, 1.0, 0.0, 0.0]),
            record(other, "bio", [0.0, 0.0, 1.0, 0.0]),
        ])
        .await;

        handle.retire_owner(owner).unwrap();
        let hits = handle.search(&query([1.0, 1.0, 1.0, 0.0]), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.owner_id, other);
        assert!(handle.owner_vectors(owner, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_compacts_stale_entries() {
        let owner = OwnerId::new();
        let store = MemoryRecordStore::new();
        let first = record(owner, "bio", [1.0, 0.0, 0.0, 0.0]);
        store.append(std::slice::from_ref(&first)).await.unwrap();

        let profiles = MemoryProfileStore::new();
        let handle = IndexHandle::new(&config(), DIM);
        handle.init(&store, &profiles).await.unwrap();

        let second = record(owner, "bio", [0.0, 1.0, 0.0, 0.0]);
        store.delete_by_key(owner, &second.embedding_type).await.unwrap();
        store.append(std::slice::from_ref(&second)).await.unwrap();
        handle.replace(second.key(), std::slice::from_ref(&second)).unwrap();
        assert_eq!(handle.stats().unwrap().total, 2);

        let stats = handle.rebuild(&store, &profiles).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.snapshot_epoch, 3);
        assert!(!stats.compaction_recommended);
    }

    /// Record store whose scans park on `gate` once `hold` is set.
    #[derive(Default)]
    struct GatedRecordStore {
        inner: MemoryRecordStore,
        hold: AtomicBool,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl RecordStore for GatedRecordStore {
        async fn append(&self, records: &[EmbeddingRecord]) -> Result<()> {
            self.inner.append(records).await
        }

        async fn delete_by_key(
            &self,
            owner_id: OwnerId,
            embedding_type: &EmbeddingType,
        ) -> Result<usize> {
            self.inner.delete_by_key(owner_id, embedding_type).await
        }

        async fn scan(&self, filter: &RecordFilter) -> Result<affinity_storage::StoreScan> {
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            self.inner.scan(filter).await
        }

        async fn epoch(&self) -> Result<u64> {
            self.inner.epoch().await
        }
    }

    #[tokio::test]
    async fn test_changes_during_rebuild_are_replayed() {
        let a = OwnerId::new();
        let b = OwnerId::new();
        let old = record(a, "bio", [1.0, 0.0, 0.0, 0.0]);
        let store = GatedRecordStore::default();
        store
            .append(&[old.clone(), record(b, "bio", [0.0, 1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let profiles = MemoryProfileStore::new();
        let handle = IndexHandle::new(&config(), DIM);
        handle.init(&store, &profiles).await.unwrap();

        store.hold.store(true, Ordering::SeqCst);
        let new = record(a, "bio", [0.0, 0.0, 1.0, 0.0]);
        let rebuild = handle.rebuild(&store, &profiles);
        let concurrent = async {
            store.entered.notified().await;
            let second = handle.rebuild(&store, &profiles).await;
            handle.replace(old.key(), std::slice::from_ref(&new)).unwrap();
            handle.retire_owner(b).unwrap();
            store.gate.notify_one();
            second
        };
        let (rebuilt, second) = tokio::join!(rebuild, concurrent);

        assert!(matches!(second, Err(AffinityError::IndexUnavailable(_))));
        let stats = rebuilt.unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.stale, 2);

        let hits = handle.search(&query([1.0, 1.0, 1.0, 0.0]), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.record_id, new.id);
        assert!(handle.owner_vectors(b, None).unwrap().is_empty());

        // The load slot is released after the swap.
        store.hold.store(false, Ordering::SeqCst);
        assert!(handle.rebuild(&store, &profiles).await.is_ok());
    }

    #[tokio::test]
    async fn test_verified_only_bulk_load() {
        let verified = OwnerId::new();
        let unverified = OwnerId::new();
        let store = MemoryRecordStore::new();
        store
            .append(&[
                record(verified, "bio", [1.0, 0.0, 0.0, 0.0]),
                record(unverified, "bio", [0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let profiles = MemoryProfileStore::new();
        for (owner_id, is_verified) in [(verified, true), (unverified, false)] {
            profiles
                .upsert(
                    OwnerProfile {
                        owner_id,
                        gender: None,
                        verified: is_verified,
                        metadata: serde_json::Value::Null,
                    },
                    Preference::allow_all(),
                )
                .unwrap();
        }

        let handle = IndexHandle::new(&IndexConfig::default(), DIM);
        let stats = handle.init(&store, &profiles).await.unwrap();
        assert_eq!(stats.live, 1);
        let hits = handle.search(&query([0.0, 1.0, 0.0, 0.0]), 5).unwrap();
        assert_eq!(hits[0].record.owner_id, verified);
    }

    #[tokio::test]
    async fn test_init_fails_when_store_is_down() {
        let store = MemoryRecordStore::new();
        store.set_available(false);
        let handle = IndexHandle::new(&config(), DIM);
        let err = handle
            .init(&store, &MemoryProfileStore::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AffinityError::StoreUnavailable(_)));
        assert!(!handle.is_ready());

        // The failed load must not leave the handle stuck.
        store.set_available(true);
        assert!(handle.init(&store, &MemoryProfileStore::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown() {
        let handle = loaded(&[record(OwnerId::new(), "bio", [1.0, 0.0, 0.0, 0.0])]).await;
        handle.teardown().unwrap();
        assert!(matches!(
            handle.stats(),
            Err(AffinityError::IndexUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let handle = loaded(&[]).await;
        let wrong = Vector::normalized(vec![1.0, 0.0], 2).unwrap();
        assert!(matches!(
            handle.search(&wrong, 1),
            Err(AffinityError::DimensionMismatch { expected: 4, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_search_filter_and_counter() {
        let a = OwnerId::new();
        let b = OwnerId::new();
        let handle = loaded(&[
            record(a, "bio", [1.0, 0.0, 0.0, 0.0]),
            record(b, "bio", [0.9, 0.1, 0.0, 0.0]),
        ])
        .await;
        let hits = handle
            .search_filtered(&query([1.0, 0.0, 0.0, 0.0]), 5, |r| r.owner_id == b)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.owner_id, b);
        assert_eq!(handle.stats().unwrap().searches, 1);
    }

    #[test]
    fn test_large_graph_uses_hnsw_path() {
        let mut index = AnnIndex::new(DIM, HnswConfig::from(&config()), 0);
        let owner = OwnerId::new();
        for i in 0..(EXACT_SCAN_LIMIT + 50) {
            let t = i as f32 * 0.01;
            index.add(&record(owner, &format!("slot-{}", i), [t.cos(), t.sin(), 0.1, 0.0]));
        }
        let target = query([1.0, 0.0, 0.1, 0.0]);
        let hits = index.search(target.as_slice(), 3, |_| true);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].1, 0);
    }
}
