//! Async encoder front-end.
//!
//! Wraps a synchronous [`Encoder`] with:
//! - a bounded memo of recent raw inputs (moka, keyed by xxh64 of the input),
//! - CPU offload through `spawn_blocking`, bounded by a semaphore,
//! - L2 normalization and a dimension check on every produced vector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use affinity_core::config::EncoderConfig;
use affinity_core::error::{AffinityError, EncodeError, Result};
use affinity_core::types::{ContentItem, Vector};

use crate::embedding::Encoder;

/// Memo key: xxh64 of the input bytes, tagged by content kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct MemoKey(u64);

impl MemoKey {
    fn of(item: &ContentItem) -> Self {
        let (seed, bytes) = match item {
            ContentItem::Text(text) => (0, text.as_bytes()),
            ContentItem::Image(bytes) => (1, bytes.as_slice()),
        };
        Self(xxhash_rust::xxh64::xxh64(bytes, seed))
    }
}

/// Memo hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
}

/// Async, memoizing, normalizing front-end over an [`Encoder`].
pub struct EncoderService {
    encoder: Arc<dyn Encoder>,
    memo: Cache<MemoKey, Vector>,
    permits: Arc<Semaphore>,
    dimension: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for EncoderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderService")
            .field("model", &self.encoder.model_name())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl EncoderService {
    /// Wrap `encoder`, checking that it publishes the configured dimension.
    pub fn new(encoder: Arc<dyn Encoder>, config: &EncoderConfig) -> Result<Self> {
        if encoder.dimensions() != config.dimensions {
            return Err(AffinityError::DimensionMismatch {
                expected: config.dimensions,
                actual: encoder.dimensions(),
            });
        }

        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            config.workers
        };

        info!(
            model = encoder.model_name(),
            dimension = config.dimensions,
            workers,
            memo_capacity = config.memo_capacity,
            "Encoder service initialized"
        );

        Ok(Self {
            encoder,
            memo: Cache::builder().max_capacity(config.memo_capacity).build(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            dimension: config.dimensions,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        self.encoder.model_name()
    }

    /// Encode one item into a normalized vector of the published dimension.
    pub async fn encode(&self, item: &ContentItem) -> std::result::Result<Vector, EncodeError> {
        let key = MemoKey::of(item);
        if let Some(vector) = self.memo.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EncodeError::Model("encoder pool closed".to_string()))?;

        let encoder = Arc::clone(&self.encoder);
        let owned = item.clone();
        let raw = tokio::task::spawn_blocking(move || encoder.encode(&owned))
            .await
            .map_err(|e| EncodeError::Model(format!("encode task panicked: {}", e)))??;

        let vector = self.normalize(raw)?;
        self.memo.insert(key, vector.clone());
        Ok(vector)
    }

    /// Encode a query string. Encode failures become `AffinityError::Encode`.
    pub async fn encode_text(&self, text: &str) -> Result<Vector> {
        Ok(self.encode(&ContentItem::Text(text.to_string())).await?)
    }

    /// Encode a batch concurrently. Results are returned in input order and
    /// each item fails or succeeds on its own.
    pub async fn encode_batch(
        self: &Arc<Self>,
        items: &[ContentItem],
    ) -> Vec<std::result::Result<Vector, EncodeError>> {
        let mut tasks = JoinSet::new();
        for (position, item) in items.iter().cloned().enumerate() {
            let service = Arc::clone(self);
            tasks.spawn(async move { (position, service.encode(&item).await) });
        }

        let mut results: Vec<std::result::Result<Vector, EncodeError>> =
            vec![Err(EncodeError::Model("encode task lost".to_string())); items.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = result,
                Err(e) => debug!(error = %e, "Encode task failed to join"),
            }
        }
        results
    }

    pub fn memo_stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn normalize(&self, raw: Vec<f32>) -> std::result::Result<Vector, EncodeError> {
        if raw.len() != self.dimension {
            return Err(EncodeError::Dimension {
                expected: self.dimension,
                actual: raw.len(),
            });
        }
        Vector::normalized(raw, self.dimension).map_err(|_| EncodeError::Degenerate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FeatureHashEncoder;

    fn config(dimensions: usize) -> EncoderConfig {
        EncoderConfig {
            dimensions,
            workers: 2,
            ..Default::default()
        }
    }

    fn service(dimensions: usize) -> Arc<EncoderService> {
        Arc::new(
            EncoderService::new(Arc::new(FeatureHashEncoder::new(dimensions)), &config(dimensions))
                .unwrap(),
        )
    }

    /// Produces a fixed vector regardless of input.
    struct FixedEncoder(Vec<f32>);

    impl Encoder for FixedEncoder {
        fn encode(&self, _item: &ContentItem) -> std::result::Result<Vec<f32>, EncodeError> {
            Ok(self.0.clone())
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_encode_is_normalized_and_deterministic() {
        let svc = service(384);
        let v1 = svc.encode_text("loves hiking and coffee").await.unwrap();
        let v2 = svc.encode_text("loves hiking and coffee").await.unwrap();
        assert_eq!(v1.as_slice(), v2.as_slice());
        assert!((v1.norm() - 1.0).abs() < 1e-5);
        assert_eq!(v1.dimension(), 384);
    }

    #[tokio::test]
    async fn test_memo_hits_on_repeat() {
        let svc = service(64);
        svc.encode_text("repeat me").await.unwrap();
        svc.encode_text("repeat me").await.unwrap();
        svc.encode_text("something else").await.unwrap();
        let stats = svc.memo_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let svc = service(64);
        let items = vec![
            ContentItem::Text("first item".into()),
            ContentItem::Text("   ".into()),
            ContentItem::Image(b"not an image".to_vec()),
            ContentItem::Text("fourth item".into()),
        ];
        let results = svc.encode_batch(&items).await;
        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(EncodeError::Empty));
        assert!(matches!(results[2], Err(EncodeError::Corrupt(_))));
        let expected = svc.encode_text("fourth item").await.unwrap();
        assert_eq!(results[3].as_ref().unwrap(), &expected);
    }

    #[tokio::test]
    async fn test_zero_vector_is_degenerate() {
        let svc = EncoderService::new(Arc::new(FixedEncoder(vec![0.0; 3])), &config(3)).unwrap();
        let err = svc.encode(&ContentItem::Text("x".into())).await.unwrap_err();
        assert_eq!(err, EncodeError::Degenerate);
    }

    #[test]
    fn test_dimension_mismatch_rejected_at_construction() {
        let err = EncoderService::new(Arc::new(FeatureHashEncoder::new(32)), &config(64)).unwrap_err();
        assert!(matches!(
            err,
            AffinityError::DimensionMismatch {
                expected: 64,
                actual: 32
            }
        ));
    }
}
