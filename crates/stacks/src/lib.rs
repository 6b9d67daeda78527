//! Stacks: the patch catalog.
//!
//! A single-file SQLite store for everything the librarian knows about
//! patches: the blobs themselves keyed by `(synth, fingerprint)`, category
//! definitions with their permanent bit indexes, free-form lists, synth and
//! user banks, and one import list per acquisition. Schema versions march
//! forward through idempotent migrations; read-write catalogs protect
//! themselves with automatic, retention-trimmed backups.

pub mod backup;
pub mod categories;
pub mod error;
pub mod filter;
pub mod migrations;
pub mod store;

pub use error::{Result, StoreError};
pub use filter::{compile_filter, CompiledFilter, PatchFilter, PatchOrdering, SqlExpr};
pub use migrations::SCHEMA_VERSION;
pub use store::{
    ImportInfo, ListInfo, LoadedList, MergeReport, OpenMode, PatchDatabase, UpdateFields,
    DATABASE_FILE_NAME,
};
