//! CLI argument definitions for the Affinity application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use affinity_core::types::{EmbeddingType, OwnerId};

/// Semantic match search over owner embeddings.
#[derive(Parser, Debug)]
#[command(name = "affinity", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory holding the SQLite database.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode content for an owner, replacing their previous records of the type.
    Ingest {
        #[arg(long)]
        owner: OwnerId,
        /// Embedding type: text, image, photo-slot-N, or any custom label.
        #[arg(long = "type", default_value = "text")]
        embedding_type: EmbeddingType,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        data_type: Option<String>,
        /// Image files to ingest alongside the texts.
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        texts: Vec<String>,
    },

    /// Search for eligible owners matching a free-text query.
    Search {
        /// The requesting owner.
        #[arg(long)]
        owner: OwnerId,
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        agent: Option<String>,
        /// Owners already seen by the requester.
        #[arg(long = "exclude")]
        exclude: Vec<OwnerId>,
        query: String,
    },

    /// List owners whose records resemble an owner's own records.
    Similar {
        #[arg(long)]
        owner: OwnerId,
        #[arg(long = "type")]
        embedding_type: Option<EmbeddingType>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, default_value_t = 10)]
        max: usize,
    },

    /// Compare the records of two owners.
    Compare {
        owner_a: OwnerId,
        owner_b: OwnerId,
        #[arg(long = "type")]
        embedding_type: Option<EmbeddingType>,
    },

    /// Create or update an owner's profile and match preference.
    Profile {
        #[arg(long)]
        owner: OwnerId,
        #[arg(long)]
        gender: Option<String>,
        /// Genders the owner wants to see; repeat for several.
        #[arg(long = "prefer")]
        prefer: Vec<String>,
        #[arg(long)]
        verified: bool,
        /// Only match verified owners.
        #[arg(long)]
        require_verified: bool,
        /// Profile metadata as a JSON object.
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Remove every indexed record of an owner until the next rebuild.
    Retire {
        #[arg(long)]
        owner: OwnerId,
    },

    /// Rebuild the index from the record store and report statistics.
    Rebuild,

    /// Print index, cache and encoder statistics.
    Stats,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > AFFINITY_CONFIG env var > platform default (~/.affinity/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("AFFINITY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Priority: --data-dir flag > AFFINITY_DATA_DIR env var > config file value.
    /// Returns `None` if neither is overridden (use config default).
    pub fn resolve_data_dir(&self) -> Option<String> {
        if let Some(ref p) = self.data_dir {
            return Some(p.to_string_lossy().to_string());
        }
        std::env::var("AFFINITY_DATA_DIR").ok()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    /// Returns `None` if not overridden.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".affinity").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".affinity").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let owner = OwnerId::new();
        let args = CliArgs::parse_from([
            "affinity",
            "search",
            "--owner",
            &owner.to_string(),
            "--page-size",
            "5",
            "hiking and coffee",
        ]);
        match args.command {
            Command::Search {
                owner: parsed,
                page_size,
                query,
                ..
            } => {
                assert_eq!(parsed, owner);
                assert_eq!(page_size, Some(5));
                assert_eq!(query, "hiking and coffee");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ingest_type() {
        let owner = OwnerId::new();
        let args = CliArgs::parse_from([
            "affinity",
            "ingest",
            "--owner",
            &owner.to_string(),
            "--type",
            "photo-slot-2",
            "caption",
        ]);
        match args.command {
            Command::Ingest {
                embedding_type,
                texts,
                ..
            } => {
                assert_eq!(embedding_type, EmbeddingType::PhotoSlot(2));
                assert_eq!(texts, vec!["caption".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_flag_wins() {
        let args = CliArgs::parse_from(["affinity", "--config", "/tmp/a.toml", "stats"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/a.toml"));
    }
}
