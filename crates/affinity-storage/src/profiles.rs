//! SQLite-backed profile store.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use affinity_core::error::{AffinityError, Result};
use affinity_core::types::{OwnerId, OwnerProfile, Preference};

use crate::db::{run_blocking, sql_err, Database};
use crate::store::ProfileStore;

/// Profile store over the `profiles` table.
#[derive(Debug, Clone)]
pub struct SqliteProfileStore {
    db: Arc<Database>,
}

impl SqliteProfileStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace an owner's profile and matching preference.
    pub async fn upsert_profile(&self, profile: &OwnerProfile, preference: &Preference) -> Result<()> {
        let owner = profile.owner_id.to_string();
        let gender = profile.gender.clone();
        let verified = profile.verified as i32;
        let metadata = serde_json::to_string(&profile.metadata)?;
        let preferred = serde_json::to_string(&preference.preferred_genders)?;
        let require_verified = preference.require_verified as i32;

        run_blocking(&self.db, move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO profiles (owner_id, gender, verified, preferred_genders, require_verified, metadata, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, strftime('%s', 'now'))
                     ON CONFLICT(owner_id) DO UPDATE SET
                        gender = excluded.gender,
                        verified = excluded.verified,
                        preferred_genders = excluded.preferred_genders,
                        require_verified = excluded.require_verified,
                        metadata = excluded.metadata,
                        updated_at = excluded.updated_at",
                    params![owner, gender, verified, preferred, require_verified, metadata],
                )
                .map_err(sql_err("Failed to upsert profile"))?;
                Ok(())
            })
        })
        .await?;

        debug!(owner_id = %profile.owner_id, "Profile upserted");
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn get_preference(&self, owner_id: OwnerId) -> Result<Preference> {
        let owner = owner_id.to_string();
        let row: Option<(String, i32)> = run_blocking(&self.db, move |db| {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT preferred_genders, require_verified FROM profiles WHERE owner_id = ?1",
                    params![owner],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err("Failed to read preference"))
            })
        })
        .await?;

        let (preferred, require_verified) = row
            .ok_or_else(|| AffinityError::InvalidInput(format!("unknown owner {}", owner_id)))?;
        Ok(Preference {
            preferred_genders: serde_json::from_str(&preferred)?,
            require_verified: require_verified != 0,
        })
    }

    async fn list_eligible_owners(&self, predicate: &Preference) -> Result<Vec<OwnerProfile>> {
        let rows: Vec<(String, Option<String>, i32, String)> = run_blocking(&self.db, |db| {
            db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT owner_id, gender, verified, metadata FROM profiles ORDER BY owner_id",
                    )
                    .map_err(sql_err("Failed to prepare profile scan"))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                    .map_err(sql_err("Failed to scan profiles"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(sql_err("Failed to read profile row"))?;
                Ok(rows)
            })
        })
        .await?;

        let mut eligible = Vec::new();
        for (owner, gender, verified, metadata) in rows {
            let owner_id = match Uuid::parse_str(&owner) {
                Ok(id) => OwnerId(id),
                Err(e) => {
                    warn!(owner_id = %owner, error = %e, "Skipping profile with malformed id");
                    continue;
                }
            };
            let profile = OwnerProfile {
                owner_id,
                gender,
                verified: verified != 0,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            };
            if predicate.admits(&profile) {
                eligible.push(profile);
            }
        }
        Ok(eligible)
    }
}
