//! Encoder trait and implementations.
//!
//! - `OnnxTextEncoder` loads a sentence-transformer ONNX model (e.g.
//!   all-MiniLM-L6-v2) via ort and tokenizes with the HuggingFace tokenizers
//!   crate. This is the production text encoder.
//! - `FeatureHashEncoder` produces deterministic signed feature-hashing
//!   vectors for text and images. Used in tests, benchmarks, and deployments
//!   without a model directory.
//!
//! Encoders are synchronous and CPU-bound; [`crate::service::EncoderService`]
//! moves them off the async executor.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::info;

use affinity_core::error::{AffinityError, EncodeError};
use affinity_core::types::ContentItem;

/// Longest token sequence fed to the model.
const MAX_TOKENS: usize = 256;

/// Maps raw content to a fixed-dimension vector.
///
/// Implementations must be deterministic: the same input yields the same
/// vector bit-for-bit. Output need not be normalized.
pub trait Encoder: Send + Sync {
    /// Encode one item. Failure is per-item and never affects other items.
    fn encode(&self, item: &ContentItem) -> Result<Vec<f32>, EncodeError>;

    /// Published output dimension.
    fn dimensions(&self) -> usize;

    /// Human-readable model name, used in logs.
    fn model_name(&self) -> &str;

    /// Whether `ContentItem::Image` can be encoded at all.
    fn supports_images(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// OnnxTextEncoder - ONNX Runtime inference
// ---------------------------------------------------------------------------

/// ONNX Runtime-backed text encoder using a sentence-transformer model.
///
/// Expects a model directory containing:
/// - `model.onnx`: the sentence-transformer ONNX export
/// - `tokenizer.json`: the HuggingFace fast-tokenizer file
///
/// The model should accept `input_ids`, `attention_mask`, and
/// `token_type_ids` as i64 inputs and produce token-level embeddings.
/// Mean pooling (masked) is applied to produce a single vector per input.
pub struct OnnxTextEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
    model_name: String,
}

impl std::fmt::Debug for OnnxTextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxTextEncoder")
            .field("model_name", &self.model_name)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OnnxTextEncoder {
    /// Load a sentence-transformer model from the given directory.
    ///
    /// The directory must contain `model.onnx` and `tokenizer.json`.
    pub fn from_directory(model_dir: &Path, model_name: &str) -> Result<Self, AffinityError> {
        Self::from_files(
            &model_dir.join("model.onnx"),
            &model_dir.join("tokenizer.json"),
            model_name,
        )
    }

    /// Load from explicit model and tokenizer file paths.
    pub fn from_files(
        model_path: &Path,
        tokenizer_path: &Path,
        model_name: &str,
    ) -> Result<Self, AffinityError> {
        if !model_path.exists() {
            return Err(AffinityError::Config(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(AffinityError::Config(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| AffinityError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| AffinityError::Config(format!("ONNX set threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| AffinityError::Config(format!("ONNX load model: {}", e)))?;

        // Sentence-transformer output is [batch, seq_len, hidden_dim].
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .map(|d| if d > 0 { d as usize } else { 384 })
            .unwrap_or(384);

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| AffinityError::Config(format!("Failed to load tokenizer: {}", e)))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| AffinityError::Config(format!("Tokenizer truncation: {}", e)))?;

        info!(
            model = %model_path.display(),
            dimensions,
            "Loaded ONNX text encoder"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions,
            model_name: model_name.to_string(),
        })
    }

    /// Tokenize, run inference, and mean-pool the output.
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        if text.trim().is_empty() {
            return Err(EncodeError::Empty);
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EncodeError::Model(format!("Tokenization failed: {}", e)))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&t| t as i64).collect();

        let seq_len = input_ids.len();

        let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids)
            .map_err(|e| EncodeError::Model(format!("input_ids array: {}", e)))?;
        let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
            .map_err(|e| EncodeError::Model(format!("attention_mask array: {}", e)))?;
        let type_array = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids)
            .map_err(|e| EncodeError::Model(format!("token_type_ids array: {}", e)))?;

        let ids_ref = TensorRef::from_array_view(&ids_array)
            .map_err(|e| EncodeError::Model(format!("TensorRef input_ids: {}", e)))?;
        let mask_ref = TensorRef::from_array_view(&mask_array)
            .map_err(|e| EncodeError::Model(format!("TensorRef attention_mask: {}", e)))?;
        let type_ref = TensorRef::from_array_view(&type_array)
            .map_err(|e| EncodeError::Model(format!("TensorRef token_type_ids: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EncodeError::Model(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![ids_ref, mask_ref, type_ref])
            .map_err(|e| EncodeError::Model(format!("ONNX inference failed: {}", e)))?;

        // Flat slice of [1, seq_len, hidden_dim].
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::Model(format!("Extract embeddings: {}", e)))?;

        let hidden_dim = match shape.iter().copied().collect::<Vec<i64>>().as_slice() {
            [.., _, last] if *last > 0 => *last as usize,
            other => {
                return Err(EncodeError::Model(format!(
                    "Unexpected output shape: {:?}",
                    other
                )))
            }
        };

        let mut pooled = vec![0.0f32; hidden_dim];
        let mut count = 0.0f32;
        for (tok_idx, &mask_val) in attention_mask.iter().enumerate() {
            if mask_val > 0 {
                let offset = tok_idx * hidden_dim;
                for (dim, slot) in pooled.iter_mut().enumerate() {
                    *slot += data[offset + dim];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            for val in &mut pooled {
                *val /= count;
            }
        }

        Ok(pooled)
    }
}

impl Encoder for OnnxTextEncoder {
    fn encode(&self, item: &ContentItem) -> Result<Vec<f32>, EncodeError> {
        match item {
            ContentItem::Text(text) => self.encode_text(text),
            ContentItem::Image(_) => Err(EncodeError::Unsupported(format!(
                "{} encodes text only",
                self.model_name
            ))),
        }
    }

    fn supports_images(&self) -> bool {
        false
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// ---------------------------------------------------------------------------
// FeatureHashEncoder - deterministic hashed features
// ---------------------------------------------------------------------------

const TEXT_SEED: u64 = 0;
const IMAGE_SEED: u64 = 0x9e37_79b9;
const SHINGLE_WIDTH: usize = 4;

/// Signed feature-hashing encoder.
///
/// Text is lowercased and split into alphanumeric word tokens; every token
/// adds `±1` to the bucket its xxh64 hash selects, with the sign taken from
/// the hash's top bit. Two texts sharing words therefore have a positive
/// inner product, and texts sharing none are near-orthogonal.
///
/// Images must carry a PNG, JPEG, GIF or WebP signature. The bytes after the
/// signature are hashed as overlapping 4-byte shingles.
#[derive(Debug, Clone)]
pub struct FeatureHashEncoder {
    dimensions: usize,
}

impl FeatureHashEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn accumulate(&self, values: &mut [f32], bytes: &[u8], seed: u64) {
        let h = xxhash_rust::xxh64::xxh64(bytes, seed);
        let bucket = (h % self.dimensions as u64) as usize;
        values[bucket] += if h >> 63 == 1 { -1.0 } else { 1.0 };
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        let lowered = text.to_lowercase();
        let mut values = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            self.accumulate(&mut values, token.as_bytes(), TEXT_SEED);
            tokens += 1;
        }
        if tokens == 0 {
            return Err(EncodeError::Empty);
        }
        Ok(values)
    }

    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EncodeError> {
        if bytes.is_empty() {
            return Err(EncodeError::Empty);
        }
        let header = image_header_len(bytes)
            .ok_or_else(|| EncodeError::Corrupt("unrecognized image signature".to_string()))?;
        let payload = &bytes[header..];
        if payload.len() < SHINGLE_WIDTH {
            return Err(EncodeError::Corrupt("truncated image payload".to_string()));
        }

        let mut values = vec![0.0f32; self.dimensions];
        for shingle in payload.windows(SHINGLE_WIDTH) {
            self.accumulate(&mut values, shingle, IMAGE_SEED);
        }
        Ok(values)
    }
}

/// Length of the format signature, or `None` for unknown formats.
fn image_header_len(bytes: &[u8]) -> Option<usize> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];

    if bytes.starts_with(PNG) {
        Some(PNG.len())
    } else if bytes.starts_with(JPEG) {
        Some(JPEG.len())
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(6)
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some(12)
    } else {
        None
    }
}

impl Encoder for FeatureHashEncoder {
    fn encode(&self, item: &ContentItem) -> Result<Vec<f32>, EncodeError> {
        match item {
            ContentItem::Text(text) => self.encode_text(text),
            ContentItem::Image(bytes) => self.encode_image(bytes),
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "feature-hash"
    }
}
