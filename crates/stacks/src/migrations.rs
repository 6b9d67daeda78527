//! Schema creation and forward migrations.
//!
//! The schema version is a monotonic integer in the single-row
//! `schema_version` table. `migrate_schema` walks the steps from the stored
//! version to [`SCHEMA_VERSION`], each step inside its own transaction.
//! Table rebuilds switch foreign keys off for their duration.
//!
//! Version history:
//! 1 - initial schema
//! 2 - comment column on patches
//! 3 - author/info/regular columns on patches, sort_order on categories
//! 4 - list_type column on lists with backfill, patch_in_list rebuilt with
//!     the foreign key onto patches, query indexes

use rusqlite::Connection;
use tracing::{info, warn};

use crate::categories::insert_default_categories;
use crate::error::Result;

/// The schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 4;

const CREATE_PATCHES: &str = "CREATE TABLE IF NOT EXISTS patches (\
    synth TEXT NOT NULL, \
    md5 TEXT NOT NULL, \
    name TEXT, \
    type INTEGER, \
    data BLOB, \
    favorite INTEGER, \
    regular INTEGER, \
    hidden INTEGER, \
    source_name TEXT, \
    source_info TEXT, \
    midi_bank_no INTEGER, \
    midi_program_no INTEGER, \
    categories INTEGER, \
    category_user_decision INTEGER, \
    comment TEXT, \
    author TEXT, \
    info TEXT, \
    PRIMARY KEY (synth, md5))";

const CREATE_PATCH_IN_LIST: &str = "CREATE TABLE IF NOT EXISTS patch_in_list (\
    id TEXT NOT NULL, \
    synth TEXT NOT NULL, \
    md5 TEXT NOT NULL, \
    order_num INTEGER NOT NULL, \
    FOREIGN KEY (synth, md5) REFERENCES patches (synth, md5))";

const CREATE_LISTS: &str = "CREATE TABLE IF NOT EXISTS lists (\
    id TEXT PRIMARY KEY, \
    name TEXT NOT NULL, \
    synth TEXT, \
    midi_bank_number INTEGER, \
    last_synced INTEGER, \
    list_type INTEGER NOT NULL DEFAULT 0)";

const CREATE_CATEGORIES: &str = "CREATE TABLE IF NOT EXISTS categories (\
    bit_index INTEGER UNIQUE, \
    name TEXT, \
    color TEXT, \
    active INTEGER, \
    sort_order INTEGER)";

const CREATE_INDEXES: &str = "\
    CREATE INDEX IF NOT EXISTS patch_synth_name_idx ON patches (synth, name); \
    CREATE INDEX IF NOT EXISTS patch_in_list_order_idx ON patch_in_list (id, order_num, md5, synth); \
    CREATE INDEX IF NOT EXISTS patch_in_list_import_idx ON patch_in_list (synth, md5, id); \
    CREATE INDEX IF NOT EXISTS patch_visible_idx ON patches (synth, md5) WHERE hidden = 0";

/// Create the current schema on a fresh or partially present database and
/// return the version stored in it afterwards.
pub fn create_schema(conn: &Connection) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let had_categories = table_exists(&tx, "categories")?;
    tx.execute_batch(CREATE_PATCHES)?;
    tx.execute_batch(CREATE_CATEGORIES)?;
    tx.execute_batch(CREATE_LISTS)?;
    tx.execute_batch(CREATE_PATCH_IN_LIST)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (number INTEGER)")?;
    tx.execute_batch(CREATE_INDEXES)?;
    if !had_categories {
        insert_default_categories(&tx)?;
    }

    let version: Option<i64> = tx
        .query_row("SELECT number FROM schema_version", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let version = match version {
        Some(version) => version,
        None => {
            // Brand new database: stamp it with the current version.
            tx.execute("INSERT INTO schema_version (number) VALUES (?1)", [SCHEMA_VERSION])?;
            SCHEMA_VERSION
        }
    };
    tx.commit()?;
    Ok(version)
}

/// Read the stored schema version without modifying anything.
pub fn read_schema_version(conn: &Connection) -> Result<Option<i64>> {
    if !table_exists(conn, "schema_version")? {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT number FROM schema_version", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(version)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, definition: &str) -> Result<()> {
    if column_exists(conn, table, column)? {
        warn!(table, column, "column already present, database partially migrated?");
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    Ok(())
}

/// Rebuild a table under a new definition, carrying over the given columns.
/// Foreign keys must be off around this, the caller owns that switch.
fn migrate_table(
    conn: &Connection,
    table: &str,
    create_new: &str,
    columns: &[&str],
) -> Result<()> {
    let old_table = format!("{table}_old");
    conn.execute_batch(&format!("ALTER TABLE {table} RENAME TO {old_table}"))?;
    conn.execute_batch(create_new)?;
    let column_list = columns.join(", ");
    conn.execute_batch(&format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM {old_table}"
    ))?;
    conn.execute_batch(&format!("DROP TABLE {old_table}"))?;
    Ok(())
}

/// Migrate from `current_version` up to [`SCHEMA_VERSION`].
pub fn migrate_schema(conn: &Connection, current_version: i64) -> Result<()> {
    if current_version < 2 {
        info!("migrating catalog schema to version 2");
        let tx = conn.unchecked_transaction()?;
        add_column_if_missing(&tx, "patches", "comment", "TEXT")?;
        tx.execute("UPDATE schema_version SET number = 2", [])?;
        tx.commit()?;
    }
    if current_version < 3 {
        info!("migrating catalog schema to version 3");
        let tx = conn.unchecked_transaction()?;
        add_column_if_missing(&tx, "patches", "author", "TEXT")?;
        add_column_if_missing(&tx, "patches", "info", "TEXT")?;
        add_column_if_missing(&tx, "patches", "regular", "INTEGER")?;
        tx.execute("UPDATE patches SET regular = 0 WHERE regular IS NULL", [])?;
        add_column_if_missing(&tx, "categories", "sort_order", "INTEGER")?;
        tx.execute(
            "UPDATE categories SET sort_order = bit_index WHERE sort_order IS NULL",
            [],
        )?;
        tx.execute("UPDATE schema_version SET number = 3", [])?;
        tx.commit()?;
    }
    if current_version < 4 {
        info!("migrating catalog schema to version 4");
        // Rebuilding patch_in_list needs the foreign key enforcement out of
        // the way while the table is renamed underneath it.
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        let tx = conn.unchecked_transaction()?;
        add_column_if_missing(&tx, "lists", "list_type", "INTEGER NOT NULL DEFAULT 0")?;
        // Old catalogs marked banks by a synth binding plus the well-known
        // id scheme; everything synth-bound without it is a user bank, a
        // synth binding without bank number marks an import list.
        tx.execute_batch(
            "UPDATE lists SET list_type = CASE \
             WHEN synth IS NULL THEN 0 \
             WHEN midi_bank_number IS NOT NULL AND id = synth || '-bank-' || midi_bank_number THEN 1 \
             WHEN midi_bank_number IS NOT NULL THEN 2 \
             ELSE 3 END",
        )?;
        migrate_table(
            &tx,
            "patch_in_list",
            CREATE_PATCH_IN_LIST,
            &["id", "synth", "md5", "order_num"],
        )?;
        tx.execute_batch(CREATE_INDEXES)?;
        tx.execute("UPDATE schema_version SET number = 4", [])?;
        tx.commit()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    Ok(())
}

/// The version-1 schema, used by migration tests to fabricate old catalogs.
#[doc(hidden)]
pub fn create_v1_schema_for_tests(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE patches (\
            synth TEXT NOT NULL, md5 TEXT NOT NULL, name TEXT, type INTEGER, data BLOB, \
            favorite INTEGER, hidden INTEGER, source_name TEXT, source_info TEXT, \
            midi_bank_no INTEGER, midi_program_no INTEGER, categories INTEGER, \
            category_user_decision INTEGER, PRIMARY KEY (synth, md5)); \
         CREATE TABLE categories (bit_index INTEGER UNIQUE, name TEXT, color TEXT, active INTEGER); \
         CREATE TABLE lists (id TEXT PRIMARY KEY, name TEXT NOT NULL, synth TEXT, \
            midi_bank_number INTEGER, last_synced INTEGER); \
         CREATE TABLE patch_in_list (id TEXT NOT NULL, synth TEXT NOT NULL, md5 TEXT NOT NULL, \
            order_num INTEGER NOT NULL); \
         CREATE TABLE schema_version (number INTEGER); \
         INSERT INTO schema_version (number) VALUES (1);",
    )?;
    Ok(())
}
