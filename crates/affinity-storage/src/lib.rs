//! Affinity Storage crate - record and profile stores.
//!
//! Defines the `RecordStore` and `ProfileStore` contracts the matching engine
//! depends on, with in-memory implementations and WAL-mode SQLite
//! implementations backed by a migrated schema.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod profiles;
pub mod records;
pub mod store;

pub use db::Database;
pub use memory::{MemoryProfileStore, MemoryRecordStore};
pub use profiles::SqliteProfileStore;
pub use records::SqliteRecordStore;
pub use store::{ProfileStore, RecordStore, StoreScan};
