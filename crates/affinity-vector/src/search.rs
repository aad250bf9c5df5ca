//! Match engine: semantic search over owner embeddings with eligibility
//! filtering, per-owner deduplication and a semantic query cache.
//!
//! `MatchEngine` orchestrates the encoder service (to embed queries), the
//! profile store (to decide who may be shown), and the shared index (to find
//! nearest neighbors).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use affinity_core::config::{CacheConfig, SearchConfig};
use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{similarity_score, AgentId, EmbeddingType, OwnerId, OwnerProfile};
use affinity_storage::ProfileStore;

use crate::cache::{CachePartition, CacheStats, SemanticCache};
use crate::index::{IndexHandle, IndexStats, ScoredRecord};
use crate::service::{EncoderService, MemoStats};

/// A match query from one requester.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query_text: String,
    pub requester: OwnerId,
    /// Only consider records produced for this agent.
    pub agent_id: Option<AgentId>,
    /// Defaults to `search.default_page_size`; capped at `search.max_page_size`.
    pub page_size: Option<usize>,
    /// Floor on the `[0, 1]` similarity score.
    pub similarity_threshold: Option<f64>,
    /// Owners the requester has already seen.
    #[serde(default)]
    pub exclude: Vec<OwnerId>,
}

impl SearchRequest {
    pub fn new(query_text: impl Into<String>, requester: OwnerId) -> Self {
        Self {
            query_text: query_text.into(),
            requester,
            agent_id: None,
            page_size: None,
            similarity_threshold: None,
            exclude: Vec::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn excluding(mut self, owners: impl IntoIterator<Item = OwnerId>) -> Self {
        self.exclude.extend(owners);
        self
    }
}

/// One matched owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub owner_id: OwnerId,
    pub similarity_score: f64,
    pub embedding_type: EmbeddingType,
    pub data_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub profile_metadata: serde_json::Value,
}

/// Summary statistics of a match response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchMeta {
    /// Distinct owners above the threshold, before page truncation.
    pub total_matches: usize,
    pub max_similarity: f64,
    pub mean_similarity: f64,
    pub min_similarity: f64,
    pub query_text: String,
    pub cached: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub results: Vec<Match>,
    pub meta: MatchMeta,
}

/// An owner similar to a reference owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarOwner {
    pub owner_id: OwnerId,
    pub similarity_score: f64,
    pub embedding_type: EmbeddingType,
}

/// Pairwise similarity between two owners' live records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerComparison {
    pub owner_a: OwnerId,
    pub owner_b: OwnerId,
    pub best_similarity: f64,
    pub mean_similarity: f64,
    pub compared_pairs: usize,
}

/// Combined engine counters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub cache: CacheStats,
    pub memo_hits: u64,
    pub memo_misses: u64,
}

/// Semantic match engine.
pub struct MatchEngine {
    encoder: Arc<EncoderService>,
    index: Arc<IndexHandle>,
    profiles: Arc<dyn ProfileStore>,
    cache: SemanticCache,
    config: SearchConfig,
}

impl MatchEngine {
    pub fn new(
        encoder: Arc<EncoderService>,
        index: Arc<IndexHandle>,
        profiles: Arc<dyn ProfileStore>,
        search: &SearchConfig,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            encoder,
            index,
            profiles,
            cache: SemanticCache::new(cache),
            config: search.clone(),
        }
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    /// Find owners whose records are semantically close to `request.query_text`
    /// and who are eligible under the requester's preference.
    ///
    /// Probes the semantic cache before touching the profile store or the
    /// index, so cache hits are served even while the store is down.
    pub async fn search_similar(&self, request: &SearchRequest) -> Result<MatchResponse> {
        let page_size = request
            .page_size
            .unwrap_or(self.config.default_page_size)
            .min(self.config.max_page_size);
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.config.similarity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AffinityError::InvalidInput(format!(
                "similarity threshold {} is outside [0, 1]",
                threshold
            )));
        }
        if !self.index.is_ready() {
            return Err(AffinityError::IndexUnavailable(
                "index is not loaded".to_string(),
            ));
        }

        let query = self
            .with_deadline("query encoding", self.encoder.encode_text(&request.query_text))
            .await?;

        let partition = CachePartition::new(
            request.requester,
            request.agent_id.as_ref(),
            page_size,
            threshold,
            &request.exclude,
        );
        if let Some(hit) = self.cache.get(partition, &query) {
            debug!(requester = %request.requester, "Serving match response from cache");
            let mut response = (*hit).clone();
            response.meta.cached = true;
            response.meta.query_text = request.query_text.clone();
            return Ok(response);
        }

        let preference = self
            .with_deadline(
                "preference lookup",
                self.profiles.get_preference(request.requester),
            )
            .await?;
        let eligible: HashMap<OwnerId, OwnerProfile> = self
            .with_deadline(
                "eligibility lookup",
                self.profiles.list_eligible_owners(&preference),
            )
            .await?
            .into_iter()
            .map(|p| (p.owner_id, p))
            .collect();

        let mut excluded: HashSet<OwnerId> = request.exclude.iter().copied().collect();
        excluded.insert(request.requester);

        let fetch = self.candidate_count(page_size);
        let hits = self.index.search_filtered(&query, fetch, |record| {
            eligible.contains_key(&record.owner_id)
                && !excluded.contains(&record.owner_id)
                && request
                    .agent_id
                    .as_ref()
                    .map_or(true, |agent| record.agent_id.as_ref() == Some(agent))
        })?;
        let candidates = hits.len();

        let mut ranked = best_per_owner(hits, threshold);
        let total_matches = ranked.len();
        ranked.truncate(page_size);

        let results: Vec<Match> = ranked
            .into_iter()
            .map(|hit| Match {
                owner_id: hit.record.owner_id,
                similarity_score: hit.score,
                embedding_type: hit.record.embedding_type.clone(),
                data_type: hit.record.data_type.clone(),
                created_at: hit.record.created_at,
                profile_metadata: eligible
                    .get(&hit.record.owner_id)
                    .map(|p| p.metadata.clone())
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let response = MatchResponse {
            meta: summarize(&results, total_matches, &request.query_text),
            results,
        };
        info!(
            requester = %request.requester,
            candidates,
            total_matches,
            returned = response.results.len(),
            "Match search complete"
        );

        self.cache
            .insert(partition, &request.query_text, query, response.clone());
        Ok(response)
    }

    /// Owners closest to `owner_id`, using the owner's own live vectors as
    /// queries. Eligibility is not applied.
    pub async fn find_similar_owners(
        &self,
        owner_id: OwnerId,
        embedding_type: Option<&EmbeddingType>,
        similarity_threshold: f64,
        max_owners: usize,
    ) -> Result<Vec<SimilarOwner>> {
        let own = self.index.owner_vectors(owner_id, embedding_type)?;
        if own.is_empty() {
            debug!(owner_id = %owner_id, "Owner has no indexed records");
            return Ok(Vec::new());
        }

        let fetch = self.candidate_count(max_owners);
        let mut best: HashMap<OwnerId, SimilarOwner> = HashMap::new();
        for (_, vector) in &own {
            let hits = self.index.search_filtered(vector, fetch, |record| {
                record.owner_id != owner_id
                    && embedding_type.map_or(true, |t| &record.embedding_type == t)
            })?;
            for hit in hits {
                if hit.score < similarity_threshold {
                    continue;
                }
                let candidate = SimilarOwner {
                    owner_id: hit.record.owner_id,
                    similarity_score: hit.score,
                    embedding_type: hit.record.embedding_type.clone(),
                };
                best.entry(candidate.owner_id)
                    .and_modify(|current| {
                        if candidate.similarity_score > current.similarity_score {
                            *current = candidate.clone();
                        }
                    })
                    .or_insert(candidate);
            }
        }

        let mut owners: Vec<SimilarOwner> = best.into_values().collect();
        owners.sort_by(|a, b| {
            b.similarity_score
                .total_cmp(&a.similarity_score)
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });
        owners.truncate(max_owners);
        Ok(owners)
    }

    /// Best and mean pairwise similarity between the live records of two owners.
    pub async fn compare_owners(
        &self,
        owner_a: OwnerId,
        owner_b: OwnerId,
        embedding_type: Option<&EmbeddingType>,
    ) -> Result<OwnerComparison> {
        let a = self.index.owner_vectors(owner_a, embedding_type)?;
        let b = self.index.owner_vectors(owner_b, embedding_type)?;
        for (owner, vectors) in [(owner_a, &a), (owner_b, &b)] {
            if vectors.is_empty() {
                return Err(AffinityError::InvalidInput(format!(
                    "owner {} has no indexed records",
                    owner
                )));
            }
        }

        let scores: Vec<f64> = a
            .iter()
            .flat_map(|(_, va)| b.iter().map(move |(_, vb)| similarity_score(va.dot(vb))))
            .collect();
        let best_similarity = scores.iter().copied().fold(f64::MIN, f64::max);
        let mean_similarity = scores.iter().sum::<f64>() / scores.len() as f64;

        Ok(OwnerComparison {
            owner_a,
            owner_b,
            best_similarity,
            mean_similarity,
            compared_pairs: scores.len(),
        })
    }

    /// Remove an owner from matching: invalidate their index entries and
    /// drop every cached response that lists them.
    pub fn retire_owner(&self, owner_id: OwnerId) -> Result<()> {
        self.index.retire_owner(owner_id)?;
        let dropped = self.cache.invalidate_owner(owner_id);
        info!(owner_id = %owner_id, cached_responses = dropped, "Owner retired");
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let MemoStats { hits, misses } = self.encoder.memo_stats();
        Ok(EngineStats {
            index: self.index.stats()?,
            cache: self.cache.stats(),
            memo_hits: hits,
            memo_misses: misses,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached response, e.g. after a rebuild.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn candidate_count(&self, wanted: usize) -> usize {
        (wanted.max(1) * self.config.overfetch_factor.max(1)).max(self.config.min_candidates)
    }

    async fn with_deadline<T, F>(&self, stage: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = Duration::from_millis(self.config.query_timeout_ms);
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(stage, timeout_ms = self.config.query_timeout_ms, "Query deadline exceeded");
                Err(AffinityError::Timeout(stage.to_string()))
            }
        }
    }
}

/// Drop hits under `threshold` and keep the best hit per owner.
/// Input is best first, so the first hit seen for an owner is its best.
fn best_per_owner(hits: Vec<ScoredRecord>, threshold: f64) -> Vec<ScoredRecord> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| hit.score >= threshold)
        .filter(|hit| seen.insert(hit.record.owner_id))
        .collect()
}

fn summarize(results: &[Match], total_matches: usize, query_text: &str) -> MatchMeta {
    if results.is_empty() {
        return MatchMeta {
            total_matches,
            query_text: query_text.to_string(),
            ..Default::default()
        };
    }
    let scores = results.iter().map(|m| m.similarity_score);
    MatchMeta {
        total_matches,
        max_similarity: scores.clone().fold(f64::MIN, f64::max),
        mean_similarity: scores.clone().sum::<f64>() / results.len() as f64,
        min_similarity: scores.fold(f64::MAX, f64::min),
        query_text: query_text.to_string(),
        cached: false,
    }
}
