//! SQLite-backed record store.
//!
//! Vectors are persisted as JSON lists. Rows written by other producers may
//! hold a stringified list instead; both forms are parsed into a canonical
//! [`Vector`] on read, and rows whose vector does not parse to the store's
//! dimension are skipped with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};
use uuid::Uuid;

use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{
    AgentId, EmbeddingRecord, EmbeddingType, OwnerId, RecordFilter, RecordId, Vector,
};

use crate::db::{run_blocking, sql_err, Database};
use crate::store::{RecordStore, StoreScan};

/// Record store over the `embeddings` table.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db: Arc<Database>,
    dimension: usize,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Database>, dimension: usize) -> Self {
        Self { db, dimension }
    }
}

/// Raw row as read from SQLite, before the vector is parsed.
struct RawRecord {
    id: String,
    owner_id: String,
    agent_id: Option<String>,
    embedding: String,
    embedding_type: String,
    data_type: Option<String>,
    source_ref: Option<String>,
    created_at: i64,
}

fn bump_epoch(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'epoch'",
        [],
    )
    .map_err(sql_err("Failed to advance epoch"))?;
    Ok(())
}

fn read_epoch(conn: &Connection) -> Result<u64> {
    let value: i64 = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'epoch'",
            [],
            |row| row.get(0),
        )
        .map_err(sql_err("Failed to read epoch"))?;
    Ok(value.max(0) as u64)
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| AffinityError::Serialization(format!("bad {} '{}': {}", field, raw, e)))
}

/// Parse a stored vector column that holds either a JSON list or a loosely
/// formatted stringified list.
fn parse_embedding(raw: &str, dimension: usize) -> Result<Vector> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => Vector::parse_stored(&value, dimension),
        Err(_) => Vector::parse_text(raw, dimension),
    }
}

fn to_record(raw: RawRecord, dimension: usize) -> Result<EmbeddingRecord> {
    let vector = parse_embedding(&raw.embedding, dimension)?;
    let created_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(raw.created_at)
        .single()
        .unwrap_or_default();
    Ok(EmbeddingRecord {
        id: RecordId(parse_uuid(&raw.id, "record id")?),
        owner_id: OwnerId(parse_uuid(&raw.owner_id, "owner id")?),
        agent_id: raw.agent_id.map(AgentId),
        vector,
        embedding_type: raw.embedding_type.parse()?,
        data_type: raw.data_type,
        created_at,
        source_ref: raw.source_ref,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn append(&self, records: &[EmbeddingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(|r| {
                Ok((
                    r.id.to_string(),
                    r.owner_id.to_string(),
                    r.agent_id.as_ref().map(|a| a.0.clone()),
                    serde_json::to_string(r.vector.as_slice())?,
                    r.embedding_type.to_string(),
                    r.data_type.clone(),
                    r.source_ref.clone(),
                    r.created_at.timestamp_millis(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = rows.len();
        run_blocking(&self.db, move |db| {
            db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(sql_err("Failed to begin transaction"))?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT INTO embeddings
                             (id, owner_id, agent_id, embedding, embedding_type, data_type, source_ref, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        )
                        .map_err(sql_err("Failed to prepare insert"))?;
                    for row in &rows {
                        stmt.execute(params![row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7])
                            .map_err(sql_err("Failed to insert embedding"))?;
                    }
                }
                bump_epoch(&tx)?;
                tx.commit().map_err(sql_err("Failed to commit"))?;
                Ok(())
            })
        })
        .await?;

        debug!(count, "Appended embedding records");
        Ok(())
    }

    async fn delete_by_key(
        &self,
        owner_id: OwnerId,
        embedding_type: &EmbeddingType,
    ) -> Result<usize> {
        let owner = owner_id.to_string();
        let ty = embedding_type.to_string();
        run_blocking(&self.db, move |db| {
            db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(sql_err("Failed to begin transaction"))?;
                let removed = tx
                    .execute(
                        "DELETE FROM embeddings WHERE owner_id = ?1 AND embedding_type = ?2",
                        params![owner, ty],
                    )
                    .map_err(sql_err("Failed to delete embeddings"))?;
                bump_epoch(&tx)?;
                tx.commit().map_err(sql_err("Failed to commit"))?;
                Ok(removed)
            })
        })
        .await
    }

    async fn scan(&self, filter: &RecordFilter) -> Result<StoreScan> {
        let filter = filter.clone();
        let dimension = self.dimension;
        run_blocking(&self.db, move |db| {
            db.with_conn(|conn| {
                let mut sql = String::from(
                    "SELECT id, owner_id, agent_id, embedding, embedding_type, data_type, source_ref, created_at
                     FROM embeddings WHERE 1 = 1",
                );
                let mut args: Vec<String> = Vec::new();
                if let Some(ref ty) = filter.embedding_type {
                    args.push(ty.to_string());
                    sql.push_str(&format!(" AND embedding_type = ?{}", args.len()));
                }
                if let Some(ref agent) = filter.agent_id {
                    args.push(agent.0.clone());
                    sql.push_str(&format!(" AND agent_id = ?{}", args.len()));
                }
                sql.push_str(" ORDER BY created_at, id");

                let epoch = read_epoch(conn)?;
                let mut stmt = conn.prepare(&sql).map_err(sql_err("Failed to prepare scan"))?;
                let raws = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                        Ok(RawRecord {
                            id: row.get(0)?,
                            owner_id: row.get(1)?,
                            agent_id: row.get(2)?,
                            embedding: row.get(3)?,
                            embedding_type: row.get(4)?,
                            data_type: row.get(5)?,
                            source_ref: row.get(6)?,
                            created_at: row.get(7)?,
                        })
                    })
                    .map_err(sql_err("Failed to scan embeddings"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(sql_err("Failed to read embedding row"))?;

                let mut scan = StoreScan {
                    records: Vec::with_capacity(raws.len()),
                    skipped: 0,
                    epoch,
                };
                for raw in raws {
                    let id = raw.id.clone();
                    match to_record(raw, dimension) {
                        Ok(record) if filter.matches(&record) => scan.records.push(record),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(record_id = %id, error = %e, "Skipping unreadable embedding row");
                            scan.skipped += 1;
                        }
                    }
                }
                Ok(scan)
            })
        })
        .await
    }

    async fn epoch(&self) -> Result<u64> {
        run_blocking(&self.db, |db| db.with_conn(read_epoch)).await
    }
}
