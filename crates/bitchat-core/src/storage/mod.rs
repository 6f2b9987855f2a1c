//! Local persistence in SQLite.
//!
//! Holds the node identity and the peer table so trust decisions survive a
//! restart. Sessions, dedup state and messages are never written to disk.

mod database;
mod schema;

pub use database::{Database, DatabaseConfig};
pub use schema::SCHEMA_VERSION;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "bitchat.db";
