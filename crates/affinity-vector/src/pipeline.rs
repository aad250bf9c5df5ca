//! Affinity ingestion pipeline.
//!
//! `IngestionPipeline` turns raw owner content into stored, indexed
//! embedding records:
//! 1. Batch the items
//! 2. Encode each batch concurrently (per-item failures are recorded, not raised)
//! 3. Replace the owner's previous records for the embedding type
//! 4. Append the new records to the store and the index

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{
    AgentId, ContentItem, EmbeddingRecord, EmbeddingType, OwnerId, RecordId, RecordKey,
};
use affinity_storage::RecordStore;

use crate::index::IndexHandle;
use crate::service::EncoderService;

/// One ingestion call: a list of items for one owner and embedding type.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub items: Vec<ContentItem>,
    pub owner_id: OwnerId,
    pub embedding_type: EmbeddingType,
    pub agent_id: Option<AgentId>,
    pub data_type: Option<String>,
    /// Opaque pointer back to the source content, stored with each record.
    pub source_ref: Option<String>,
}

impl IngestRequest {
    pub fn new(owner_id: OwnerId, embedding_type: EmbeddingType, items: Vec<ContentItem>) -> Self {
        Self {
            items,
            owner_id,
            embedding_type,
            agent_id: None,
            data_type: None,
            source_ref: None,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Created,
    Failed,
}

/// Outcome for one input item, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    /// Id of the created record; `None` when the item failed.
    pub id: Option<RecordId>,
    pub status: IngestStatus,
    /// Why the item failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemStatus {
    fn created(id: RecordId) -> Self {
        Self {
            id: Some(id),
            status: IngestStatus::Created,
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            id: None,
            status: IngestStatus::Failed,
            error: Some(error.to_string()),
        }
    }

    pub fn is_created(&self) -> bool {
        self.status == IngestStatus::Created
    }
}

/// The main Affinity ingestion pipeline.
pub struct IngestionPipeline {
    encoder: Arc<EncoderService>,
    store: Arc<dyn RecordStore>,
    index: Arc<IndexHandle>,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        encoder: Arc<EncoderService>,
        store: Arc<dyn RecordStore>,
        index: Arc<IndexHandle>,
        batch_size: usize,
    ) -> Self {
        Self {
            encoder,
            store,
            index,
            batch_size: batch_size.max(1),
        }
    }

    /// Encode, store and index every item of `request`.
    ///
    /// Returns one status per item in input order. Encode failures only mark
    /// their own item; a store failure fails the whole call. Records written
    /// by earlier batches of a failed call stay in place.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Vec<ItemStatus>> {
        let key = RecordKey {
            owner_id: request.owner_id,
            embedding_type: request.embedding_type.clone(),
        };
        info!(
            owner_id = %key.owner_id,
            embedding_type = %key.embedding_type,
            items = request.items.len(),
            "Ingesting items"
        );

        let mut statuses = Vec::with_capacity(request.items.len());
        let mut replaced = false;

        for batch in request.items.chunks(self.batch_size) {
            let encoded = self.encoder.encode_batch(batch).await;

            let mut records = Vec::new();
            let mut batch_statuses = Vec::with_capacity(batch.len());
            for (position, result) in encoded.into_iter().enumerate() {
                match result {
                    Ok(vector) => {
                        let record = EmbeddingRecord {
                            id: RecordId::new(),
                            owner_id: request.owner_id,
                            agent_id: request.agent_id.clone(),
                            vector,
                            embedding_type: request.embedding_type.clone(),
                            data_type: request.data_type.clone(),
                            created_at: Utc::now(),
                            source_ref: request.source_ref.clone(),
                        };
                        batch_statuses.push(ItemStatus::created(record.id));
                        records.push(record);
                    }
                    Err(e) => {
                        warn!(
                            owner_id = %key.owner_id,
                            item = statuses.len() + position,
                            kind = batch[position].kind(),
                            error = %e,
                            "Item failed to encode"
                        );
                        batch_statuses.push(ItemStatus::failed(e));
                    }
                }
            }

            if !records.is_empty() {
                if !replaced {
                    let removed = self
                        .store
                        .delete_by_key(key.owner_id, &key.embedding_type)
                        .await?;
                    // Index must not outlive the deleted rows.
                    self.index_replace(&key, &[])?;
                    debug!(owner_id = %key.owner_id, removed, "Removed previous records");
                    replaced = true;
                }
                self.store.append(&records).await?;
                self.index_append(&records)?;
            }
            statuses.extend(batch_statuses);
        }

        let created = statuses.iter().filter(|s| s.is_created()).count();
        info!(
            owner_id = %key.owner_id,
            created,
            failed = statuses.len() - created,
            "Ingestion complete"
        );
        Ok(statuses)
    }

    fn index_replace(&self, key: &RecordKey, records: &[EmbeddingRecord]) -> Result<()> {
        self.index.replace(key.clone(), records).map_err(log_index_error)
    }

    fn index_append(&self, records: &[EmbeddingRecord]) -> Result<()> {
        self.index.append(records).map_err(log_index_error)
    }
}

fn log_index_error(e: AffinityError) -> AffinityError {
    warn!(error = %e, "Stored records could not be indexed; a rebuild will pick them up");
    e
}
