//! Self-healing SQLite storage for swincebot.
//!
//! [`setup`] brings the database file at a configured path to a known-good,
//! schema-correct state and hands back the single [`StorageHandle`] the rest
//! of the process shares. Anything suspicious about an existing file (a
//! pragma that will not apply, a failed integrity check, a schema that drifted
//! from [`SCHEMA_SQL`]) moves that file aside and starts over from a blank
//! database.

use std::path::PathBuf;

use thiserror::Error;

mod backup;
mod bootstrap;
mod handle;
mod integrity;
mod pragma;

pub use backup::{backup, BackupRecord};
pub use bootstrap::{create_database, setup, BootstrapState};
pub use handle::{Nomination, Season, StorageHandle, Swince, SwinceurParams};
pub use integrity::{check_consistency, check_schema, normalize_sql, SchemaSnapshot};
pub use pragma::{enforce, required_pragmas, PragmaConstraint};

/// Table definitions every valid database must carry, in creation order.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const DEFAULT_DATABASE_PATH: &str = "store.db";
pub const DEFAULT_CACHE_SIZE: u32 = 16_000;

/// Operator settings consumed by [`setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Cache kept in memory, emitted as `PRAGMA cache_size = -<cache_size>`.
    pub cache_size: u32,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, cache_size: u32) -> Self {
        Self { path: path.into(), cache_size }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE_PATH, DEFAULT_CACHE_SIZE)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("PRAGMA {pragma} = {value} failed: {source}")]
    Pragma {
        pragma: String,
        value: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("integrity check query failed: {0}")]
    IntegrityQuery(#[source] rusqlite::Error),
    #[error("integrity check reported corruption: {0}")]
    Corruption(String),
    #[error("failed to read schema: {0}")]
    SchemaFetch(#[source] rusqlite::Error),
    #[error("database schema does not match expected definition")]
    SchemaMismatch { expected: String, actual: String },
    #[error("failed to create database at {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("storage handle is closed")]
    Closed,
    #[error("invalid stored timestamp {value}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: time::error::Parse,
    },
    #[error("invalid stored identifier {value}: {source}")]
    InvalidId {
        value: String,
        #[source]
        source: ulid::DecodeError,
    },
    #[error("failed to format timestamp: {0}")]
    TimestampFormat(#[from] time::error::Format),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the bootstrap cascade answers this fault with backup and
    /// recreate instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Open { .. }
                | Self::Pragma { .. }
                | Self::IntegrityQuery(_)
                | Self::Corruption(_)
                | Self::SchemaFetch(_)
                | Self::SchemaMismatch { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
