use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AffinityError, Result};

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Identifier of the entity (user profile) an embedding belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OwnerId {
    type Err = AffinityError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AffinityError::InvalidInput(format!("owner id '{}': {}", s, e)))
    }
}

/// Identifier of a persisted embedding record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the conversational agent a record was produced for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Embedding Type
// =============================================================================

/// What a record's vector was computed from.
///
/// Serialized as a plain string: `"text"`, `"image"`, `"photo-slot-N"`, or any
/// other non-empty label (e.g. `"bio"`), which maps to [`EmbeddingType::Custom`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EmbeddingType {
    Text,
    Image,
    PhotoSlot(u8),
    Custom(String),
}

impl EmbeddingType {
    /// True for types whose source is image bytes rather than text.
    pub fn is_visual(&self) -> bool {
        matches!(self, EmbeddingType::Image | EmbeddingType::PhotoSlot(_))
    }
}

impl fmt::Display for EmbeddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingType::Text => f.write_str("text"),
            EmbeddingType::Image => f.write_str("image"),
            EmbeddingType::PhotoSlot(n) => write!(f, "photo-slot-{}", n),
            EmbeddingType::Custom(label) => f.write_str(label),
        }
    }
}

impl FromStr for EmbeddingType {
    type Err = AffinityError;

    fn from_str(s: &str) -> Result<Self> {
        let label = s.trim().to_ascii_lowercase();
        if label.is_empty() {
            return Err(AffinityError::InvalidInput(
                "embedding type must not be empty".to_string(),
            ));
        }
        Ok(match label.as_str() {
            "text" => EmbeddingType::Text,
            "image" => EmbeddingType::Image,
            other => match other.strip_prefix("photo-slot-").map(str::parse::<u8>) {
                Some(Ok(slot)) => EmbeddingType::PhotoSlot(slot),
                _ => EmbeddingType::Custom(label),
            },
        })
    }
}

impl From<EmbeddingType> for String {
    fn from(value: EmbeddingType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for EmbeddingType {
    type Error = AffinityError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// =============================================================================
// Vector
// =============================================================================

/// Canonical fixed-length embedding vector.
///
/// Every vector that crosses a store or encoder boundary is parsed into this
/// type first. Construction checks the dimension and rejects non-finite values;
/// nothing downstream ever sees a vector of the wrong length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vector(Vec<f32>);

impl Vector {
    /// Wrap raw values, checking the expected dimension.
    pub fn from_values(values: Vec<f32>, dimension: usize) -> Result<Self> {
        if values.len() != dimension {
            return Err(AffinityError::DimensionMismatch {
                expected: dimension,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AffinityError::InvalidInput(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(Self(values))
    }

    /// Wrap raw values and L2-normalize them.
    ///
    /// Fails on a zero-magnitude vector, which has no direction to compare.
    pub fn normalized(values: Vec<f32>, dimension: usize) -> Result<Self> {
        let mut vector = Self::from_values(values, dimension)?;
        let norm = vector.norm();
        if norm < 1e-12 {
            return Err(AffinityError::InvalidInput(
                "cannot normalize a zero vector".to_string(),
            ));
        }
        for v in &mut vector.0 {
            *v /= norm;
        }
        Ok(vector)
    }

    /// Parse a stored vector that arrived either as a JSON array of numbers or
    /// as a stringified list such as `"[0.1, 0.2, 0.3]"`.
    pub fn parse_stored(value: &serde_json::Value, dimension: usize) -> Result<Self> {
        match value {
            serde_json::Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| {
                        item.as_f64().map(|f| f as f32).ok_or_else(|| {
                            AffinityError::Serialization(format!(
                                "non-numeric vector component: {}",
                                item
                            ))
                        })
                    })
                    .collect::<Result<Vec<f32>>>()?;
                Self::from_values(values, dimension)
            }
            serde_json::Value::String(text) => Self::parse_text(text, dimension),
            other => Err(AffinityError::Serialization(format!(
                "unsupported stored vector representation: {}",
                json_kind(other)
            ))),
        }
    }

    /// Parse a stringified list, with or without surrounding brackets.
    pub fn parse_text(text: &str, dimension: usize) -> Result<Self> {
        let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
        if inner.trim().is_empty() {
            return Self::from_values(Vec::new(), dimension);
        }
        let values = inner
            .split(',')
            .map(|part| {
                part.trim().parse::<f32>().map_err(|e| {
                    AffinityError::Serialization(format!(
                        "bad vector component '{}': {}",
                        part.trim(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        Self::from_values(values, dimension)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Inner product; equals cosine similarity for two normalized vectors.
    pub fn dot(&self, other: &Vector) -> f32 {
        dot(&self.0, &other.0)
    }
}

/// Inner product of two equal-length slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Map an inner product of normalized vectors (cosine, in [-1, 1]) to [0, 1].
pub fn similarity_score(inner_product: f32) -> f64 {
    ((inner_product as f64 + 1.0) / 2.0).clamp(0.0, 1.0)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// =============================================================================
// Records
// =============================================================================

/// Raw content handed to the encoder.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContentItem {
    Text(String),
    Image(Vec<u8>),
}

impl ContentItem {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentItem::Text(_) => "text",
            ContentItem::Image(_) => "image",
        }
    }
}

/// The upsert key of an embedding record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub owner_id: OwnerId,
    pub embedding_type: EmbeddingType,
}

/// A persisted embedding. Replaced as a whole, never mutated in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub agent_id: Option<AgentId>,
    pub vector: Vector,
    pub embedding_type: EmbeddingType,
    pub data_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Where the content came from (e.g. a photo URL or prompt id).
    pub source_ref: Option<String>,
}

impl EmbeddingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            owner_id: self.owner_id,
            embedding_type: self.embedding_type.clone(),
        }
    }
}

/// Selection applied to a bulk store scan. Empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    pub owner_ids: Option<HashSet<OwnerId>>,
    pub embedding_type: Option<EmbeddingType>,
    pub agent_id: Option<AgentId>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_owners(owner_ids: impl IntoIterator<Item = OwnerId>) -> Self {
        Self {
            owner_ids: Some(owner_ids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &EmbeddingRecord) -> bool {
        if let Some(ref owners) = self.owner_ids {
            if !owners.contains(&record.owner_id) {
                return false;
            }
        }
        if let Some(ref ty) = self.embedding_type {
            if &record.embedding_type != ty {
                return false;
            }
        }
        if let Some(ref agent) = self.agent_id {
            if record.agent_id.as_ref() != Some(agent) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Eligibility
// =============================================================================

/// Matching preference of a requester, evaluated by the profile store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preference {
    /// Genders the requester wants to see. Empty admits everyone.
    pub preferred_genders: Vec<String>,
    /// Only admit owners whose verification was approved.
    pub require_verified: bool,
}

impl Preference {
    /// A predicate that admits every owner.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn admits(&self, profile: &OwnerProfile) -> bool {
        if self.require_verified && !profile.verified {
            return false;
        }
        if self.preferred_genders.is_empty() {
            return true;
        }
        profile.gender.as_ref().is_some_and(|g| {
            self.preferred_genders
                .iter()
                .any(|p| p.eq_ignore_ascii_case(g))
        })
    }
}

/// Caller-facing summary of an owner, attached to each match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerProfile {
    pub owner_id: OwnerId,
    pub gender: Option<String>,
    pub verified: bool,
    /// Free-form profile fields (name, bio, location, photos, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}
