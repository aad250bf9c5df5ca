//! Affinity application binary - composition root.
//!
//! Ties together all Affinity crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Open the SQLite record and profile stores
//! 3. Build the encoder (ONNX model if configured, feature hashing otherwise)
//! 4. Bulk-load the index and wire the ingestion pipeline and match engine
//! 5. Run one CLI command and print its result as JSON

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use affinity_core::config::{AffinityConfig, EncoderConfig};
use affinity_core::error::AffinityError;
use affinity_core::types::{AgentId, ContentItem, OwnerProfile, Preference};
use affinity_storage::{Database, ProfileStore, RecordStore, SqliteProfileStore, SqliteRecordStore};
use affinity_vector::{
    Encoder, EncoderService, FeatureHashEncoder, IndexHandle, IngestRequest, IngestionPipeline,
    MatchEngine, OnnxTextEncoder, SearchRequest,
};

use cli::{CliArgs, Command};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Load the ONNX model when a model directory is configured, otherwise fall
/// back to the feature-hash encoder.
fn build_encoder(config: &EncoderConfig) -> Result<Arc<dyn Encoder>, AffinityError> {
    match config.model_dir {
        Some(ref dir) => {
            let dir = resolve_data_dir(dir);
            let encoder = OnnxTextEncoder::from_directory(&dir, &config.model_name)?;
            tracing::info!(model = %config.model_name, dir = %dir.display(), "ONNX encoder loaded");
            if !encoder.supports_images() {
                tracing::warn!(
                    model = %config.model_name,
                    "Encoder is text-only; photo ingestion will fail per item"
                );
            }
            Ok(Arc::new(encoder))
        }
        None => {
            tracing::warn!(
                dimensions = config.dimensions,
                "No model_dir configured; using the feature-hash encoder"
            );
            Ok(Arc::new(FeatureHashEncoder::new(config.dimensions)))
        }
    }
}

fn read_image(path: &Path) -> Result<ContentItem, AffinityError> {
    let bytes = std::fs::read(path)?;
    Ok(ContentItem::Image(bytes))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AffinityError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AffinityError::Serialization(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config, then tracing at the resolved level.
    let config_file = args.resolve_config_path();
    let loaded = AffinityConfig::load(&config_file);
    let log_level = args
        .resolve_log_level()
        .or_else(|| loaded.as_ref().ok().map(|c| c.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Affinity v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            if config_file.exists() {
                tracing::warn!(path = %config_file.display(), error = %e, "Invalid config; using defaults");
            } else {
                tracing::debug!(path = %config_file.display(), "No config file; using defaults");
            }
            AffinityConfig::default()
        }
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = data_dir.join("affinity.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let records = Arc::new(SqliteRecordStore::new(
        Arc::clone(&db),
        config.encoder.dimensions,
    ));
    let profiles = Arc::new(SqliteProfileStore::new(db));

    // Profile edits do not need the encoder or the index.
    if let Command::Profile {
        owner,
        gender,
        prefer,
        verified,
        require_verified,
        metadata,
    } = &args.command
    {
        let metadata = match metadata {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| AffinityError::InvalidInput(format!("metadata: {}", e)))?,
            None => json!({}),
        };
        let profile = OwnerProfile {
            owner_id: *owner,
            gender: gender.clone(),
            verified: *verified,
            metadata,
        };
        let preference = Preference {
            preferred_genders: prefer.clone(),
            require_verified: *require_verified,
        };
        profiles.upsert_profile(&profile, &preference).await?;
        print_json(&json!({ "profile": profile, "preference": preference }))?;
        return Ok(());
    }

    // Encoder and index.
    let encoder = Arc::new(EncoderService::new(
        build_encoder(&config.encoder)?,
        &config.encoder,
    )?);
    let index = Arc::new(IndexHandle::new(&config.index, config.encoder.dimensions));
    let loaded = index.init(records.as_ref(), profiles.as_ref()).await?;
    tracing::info!(live = loaded.live, epoch = loaded.snapshot_epoch, "Index ready");

    let pipeline = IngestionPipeline::new(
        Arc::clone(&encoder),
        Arc::clone(&records) as Arc<dyn RecordStore>,
        Arc::clone(&index),
        config.ingest.batch_size,
    );
    let engine = MatchEngine::new(
        encoder,
        Arc::clone(&index),
        Arc::clone(&profiles) as Arc<dyn ProfileStore>,
        &config.search,
        &config.cache,
    );

    match args.command {
        Command::Ingest {
            owner,
            embedding_type,
            agent,
            data_type,
            images,
            texts,
        } => {
            let mut items: Vec<ContentItem> = texts.into_iter().map(ContentItem::Text).collect();
            for path in &images {
                items.push(read_image(path)?);
            }
            if items.is_empty() {
                return Err(AffinityError::InvalidInput("nothing to ingest".to_string()).into());
            }
            let mut request = IngestRequest::new(owner, embedding_type, items);
            request.agent_id = agent.map(AgentId);
            request.data_type = data_type;
            let statuses = pipeline.ingest(request).await?;
            print_json(&statuses)?;
        }
        Command::Search {
            owner,
            page_size,
            threshold,
            agent,
            exclude,
            query,
        } => {
            let request = SearchRequest {
                query_text: query,
                requester: owner,
                agent_id: agent.map(AgentId),
                page_size,
                similarity_threshold: threshold,
                exclude,
            };
            let response = engine.search_similar(&request).await?;
            print_json(&response)?;
        }
        Command::Similar {
            owner,
            embedding_type,
            threshold,
            max,
        } => {
            let threshold = threshold.unwrap_or(config.search.similarity_threshold);
            let owners = engine
                .find_similar_owners(owner, embedding_type.as_ref(), threshold, max)
                .await?;
            print_json(&owners)?;
        }
        Command::Compare {
            owner_a,
            owner_b,
            embedding_type,
        } => {
            let comparison = engine
                .compare_owners(owner_a, owner_b, embedding_type.as_ref())
                .await?;
            print_json(&comparison)?;
        }
        Command::Retire { owner } => {
            engine.retire_owner(owner)?;
            print_json(&index.stats()?)?;
        }
        Command::Rebuild => {
            let stats = index.rebuild(records.as_ref(), profiles.as_ref()).await?;
            engine.clear_cache();
            print_json(&stats)?;
        }
        Command::Stats => {
            print_json(&engine.stats()?)?;
        }
        Command::Profile { .. } => {}
    }

    Ok(())
}
