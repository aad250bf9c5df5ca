//! Semantic query cache.
//!
//! Keyed by meaning rather than by text: a lookup hits when a stored query
//! vector in the same partition has cosine similarity at or above the
//! configured threshold. Entries expire lazily on read and are evicted
//! oldest-first once capacity is reached.
//!
//! A partition is derived from the requester and the query shape (page size,
//! threshold, agent, excluded owners), so one requester's page never leaks
//! into another's results.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use affinity_core::config::CacheConfig;
use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{AgentId, OwnerId, Vector};

use crate::search::MatchResponse;

const PARTITION_SEED: u64 = 0xaff1_c0de;

/// Identifies the requester and query shape an entry was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CachePartition(u64);

impl CachePartition {
    pub fn new(
        requester: OwnerId,
        agent_id: Option<&AgentId>,
        page_size: usize,
        similarity_threshold: f64,
        exclude: &[OwnerId],
    ) -> Self {
        let mut bytes = Vec::with_capacity(64 + exclude.len() * 16);
        bytes.extend_from_slice(requester.0.as_bytes());
        bytes.extend_from_slice(&(page_size as u64).to_le_bytes());
        bytes.extend_from_slice(&similarity_threshold.to_bits().to_le_bytes());
        match agent_id {
            Some(agent) => {
                bytes.push(1);
                bytes.extend_from_slice(agent.0.as_bytes());
                bytes.push(0);
            }
            None => bytes.push(0),
        }
        let mut excluded: Vec<&OwnerId> = exclude.iter().collect();
        excluded.sort();
        excluded.dedup();
        for owner in excluded {
            bytes.extend_from_slice(owner.0.as_bytes());
        }
        Self(xxh64(&bytes, PARTITION_SEED))
    }
}

#[derive(Debug)]
struct CacheEntry {
    partition: CachePartition,
    query_text: String,
    query_vector: Vector,
    response: Arc<MatchResponse>,
    created_at: Instant,
    checksum: u64,
}

impl CacheEntry {
    fn verify(&self, dimension: usize) -> Result<()> {
        if self.query_vector.dimension() != dimension {
            return Err(AffinityError::CacheCorruption(format!(
                "entry for '{}' has {} dimensions, expected {}",
                self.query_text,
                self.query_vector.dimension(),
                dimension
            )));
        }
        if checksum(&self.query_vector) != self.checksum {
            return Err(AffinityError::CacheCorruption(format!(
                "checksum mismatch for '{}'",
                self.query_text
            )));
        }
        Ok(())
    }
}

fn checksum(vector: &Vector) -> u64 {
    let bytes: Vec<u8> = vector
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    xxh64(&bytes, 0)
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
}

/// Similarity-keyed cache of match responses.
#[derive(Debug)]
pub struct SemanticCache {
    entries: Mutex<VecDeque<CacheEntry>>,
    threshold: f32,
    ttl: Duration,
    capacity: usize,
    counters: Counters,
}

impl SemanticCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(config.capacity.min(4096))),
            threshold: config.similarity_threshold,
            ttl: Duration::from_secs(config.ttl_secs),
            capacity: config.capacity,
            counters: Counters::default(),
        }
    }

    pub fn get(&self, partition: CachePartition, query: &Vector) -> Option<Arc<MatchResponse>> {
        self.get_at(partition, query, Instant::now())
    }

    /// Look up a response for `query` as of `now`.
    ///
    /// Corrupt entries are dropped and count as misses.
    pub fn get_at(
        &self,
        partition: CachePartition,
        query: &Vector,
        now: Instant,
    ) -> Option<Arc<MatchResponse>> {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Semantic cache lock poisoned; treating lookup as a miss");
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // Entries are kept in insertion order, so expired ones sit at the front.
        while entries
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.created_at) >= self.ttl)
        {
            entries.pop_front();
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }

        let mut corrupt = Vec::new();
        let mut hit = None;
        for (position, entry) in entries.iter().enumerate() {
            if entry.partition != partition {
                continue;
            }
            if let Err(e) = entry.verify(query.dimension()) {
                warn!(error = %e, "Dropping corrupt cache entry");
                corrupt.push(position);
                continue;
            }
            let cosine = entry.query_vector.dot(query);
            if cosine >= self.threshold {
                debug!(cached_query = %entry.query_text, cosine, "Semantic cache hit");
                hit = Some(Arc::clone(&entry.response));
                break;
            }
        }

        for position in corrupt.into_iter().rev() {
            entries.remove(position);
            self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
        }

        match hit {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn insert(
        &self,
        partition: CachePartition,
        query_text: &str,
        query_vector: Vector,
        response: MatchResponse,
    ) -> Arc<MatchResponse> {
        self.insert_at(partition, query_text, query_vector, response, Instant::now())
    }

    /// Store `response` for `query_vector`, evicting the oldest entries when
    /// full. Returns the shared response.
    pub fn insert_at(
        &self,
        partition: CachePartition,
        query_text: &str,
        query_vector: Vector,
        response: MatchResponse,
        now: Instant,
    ) -> Arc<MatchResponse> {
        let response = Arc::new(response);
        if self.capacity == 0 {
            return response;
        }
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Semantic cache lock poisoned; skipping insert");
            return response;
        };

        while entries.len() >= self.capacity {
            entries.pop_front();
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(CacheEntry {
            partition,
            query_text: query_text.to_string(),
            checksum: checksum(&query_vector),
            query_vector,
            response: Arc::clone(&response),
            created_at: now,
        });
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        response
    }

    /// Drop every entry whose response lists `owner_id`. Returns how many
    /// entries were removed.
    pub fn invalidate_owner(&self, owner_id: OwnerId) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|entry| entry.response.results.iter().all(|m| m.owner_id != owner_id));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(owner_id = %owner_id, removed, "Dropped cached responses for owner");
        }
        removed
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn corrupt(&self, position: usize) {
        let mut entries = self.entries.lock().unwrap();
        entries[position].checksum ^= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MatchMeta;

    fn cache(capacity: usize) -> SemanticCache {
        SemanticCache::new(&CacheConfig {
            similarity_threshold: 0.95,
            ttl_secs: 60,
            capacity,
        })
    }

    fn unit(values: &[f32]) -> Vector {
        Vector::normalized(values.to_vec(), values.len()).unwrap()
    }

    fn response(text: &str) -> MatchResponse {
        MatchResponse {
            results: Vec::new(),
            meta: MatchMeta {
                query_text: text.to_string(),
                ..Default::default()
            },
        }
    }

    fn partition(requester: OwnerId) -> CachePartition {
        CachePartition::new(requester, None, 10, 0.0, &[])
    }

    #[test]
    fn test_hit_above_threshold_miss_below() {
        let cache = cache(8);
        let p = partition(OwnerId::new());
        cache.insert(p, "hiking", unit(&[1.0, 0.0, 0.0]), response("hiking"));

        let near = unit(&[1.0, 0.05, 0.0]);
        let hit = cache.get(p, &near).unwrap();
        assert_eq!(hit.meta.query_text, "hiking");

        let far = unit(&[1.0, 1.0, 0.0]);
        assert!(cache.get(p, &far).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_partitions_do_not_leak() {
        let cache = cache(8);
        let query = unit(&[0.0, 1.0]);
        cache.insert(partition(OwnerId::new()), "q", query.clone(), response("q"));
        assert!(cache.get(partition(OwnerId::new()), &query).is_none());
    }

    #[test]
    fn test_partition_shape() {
        let owner = OwnerId::new();
        let seen = [OwnerId::new(), OwnerId::new()];
        let reversed = [seen[1], seen[0]];
        assert_eq!(
            CachePartition::new(owner, None, 10, 0.5, &seen),
            CachePartition::new(owner, None, 10, 0.5, &reversed)
        );
        assert_ne!(
            CachePartition::new(owner, None, 10, 0.5, &[]),
            CachePartition::new(owner, None, 20, 0.5, &[])
        );
        assert_ne!(
            CachePartition::new(owner, None, 10, 0.5, &[]),
            CachePartition::new(owner, Some(&AgentId("a".into())), 10, 0.5, &[])
        );
    }

    #[test]
    fn test_entries_expire_lazily() {
        let cache = cache(8);
        let p = partition(OwnerId::new());
        let query = unit(&[1.0, 0.0]);
        let start = Instant::now();
        cache.insert_at(p, "q", query.clone(), response("q"), start);

        assert!(cache.get_at(p, &query, start + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(p, &query, start + Duration::from_secs(60)).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let cache = cache(2);
        let p = partition(OwnerId::new());
        cache.insert(p, "a", unit(&[1.0, 0.0, 0.0]), response("a"));
        cache.insert(p, "b", unit(&[0.0, 1.0, 0.0]), response("b"));
        cache.insert(p, "c", unit(&[0.0, 0.0, 1.0]), response("c"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get(p, &unit(&[1.0, 0.0, 0.0])).is_none());
        assert!(cache.get(p, &unit(&[0.0, 0.0, 1.0])).is_some());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_dropped() {
        let cache = cache(8);
        let p = partition(OwnerId::new());
        let query = unit(&[1.0, 0.0]);
        cache.insert(p, "q", query.clone(), response("q"));
        cache.corrupt(0);

        assert!(cache.get(p, &query).is_none());
        let stats = cache.stats();
        assert_eq!(stats.corruptions, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_dimension_change_is_corruption() {
        let cache = cache(8);
        let p = partition(OwnerId::new());
        cache.insert(p, "q", unit(&[1.0, 0.0]), response("q"));
        assert!(cache.get(p, &unit(&[1.0, 0.0, 0.0])).is_none());
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[test]
    fn test_invalidate_owner_drops_responses_listing_them() {
        use crate::search::Match;

        let cache = cache(8);
        let p = partition(OwnerId::new());
        let listed = OwnerId::new();
        let mut with_owner = response("a");
        with_owner.results.push(Match {
            owner_id: listed,
            similarity_score: 0.9,
            embedding_type: "bio".parse().unwrap(),
            data_type: None,
            created_at: chrono::Utc::now(),
            profile_metadata: serde_json::Value::Null,
        });
        cache.insert(p, "a", unit(&[1.0, 0.0]), with_owner);
        cache.insert(p, "b", unit(&[0.0, 1.0]), response("b"));

        assert_eq!(cache.invalidate_owner(listed), 1);
        assert!(cache.get(p, &unit(&[1.0, 0.0])).is_none());
        assert!(cache.get(p, &unit(&[0.0, 1.0])).is_some());
        assert_eq!(cache.invalidate_owner(listed), 0);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = cache(0);
        let p = partition(OwnerId::new());
        let query = unit(&[1.0]);
        cache.insert(p, "q", query.clone(), response("q"));
        assert!(cache.get(p, &query).is_none());
        assert_eq!(cache.stats().insertions, 0);
    }
}
