//! Catalog error taxonomy.

use thiserror::Error;

/// Errors surfaced by the patch catalog.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Write attempted on a read-only catalog (read-only open mode or a
    /// read-only filesystem underneath).
    #[error("the patch catalog is read-only")]
    ReadOnly,

    /// The file was produced by a newer build; opening read-write would
    /// destroy it.
    #[error("catalog schema version {found} is newer than supported version {supported}")]
    SchemaNewerThanSupported { found: i64, supported: i64 },

    #[error("operation is limited to a single synth, got {0}")]
    NotASingleSynth(usize),

    #[error("synth {0} is not configured in the registry")]
    MissingSynth(String),

    #[error("list {0} does not exist")]
    MissingList(String),

    /// Reindexing deleted a different number of rows than it rewrote; the
    /// transaction was rolled back.
    #[error("reindex mismatch: rewrote {rewritten} patches but deleted {deleted} old rows")]
    ReindexMismatch { rewritten: usize, deleted: usize },

    #[error("database error: {0}")]
    Sql(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, _) = &e {
            if inner.code == rusqlite::ErrorCode::ReadOnly {
                return StoreError::ReadOnly;
            }
        }
        StoreError::Sql(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
