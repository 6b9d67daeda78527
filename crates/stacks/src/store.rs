//! The patch catalog itself.
//!
//! A single-file SQLite database holding patches keyed by
//! `(synth, fingerprint)`, the category table, and every kind of list. One
//! writer connection guarded by a mutex; background queries open their own
//! read-only connection. All bulk mutations run inside transactions, and the
//! merge machinery composes into outer transactions (reindexing reuses it).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, Row};
use tracing::{debug, error, info, warn};

use librarian::category::CategoryBitfield;
use librarian::lists::{ImportList, PatchList, PatchListType, SynthBank};
use librarian::model::{BankNumber, Favorite, PatchHolder, ProgramNumber};
use librarian::source::SourceInfo;
use librarian::synth::{self, SynthRegistry};

use crate::backup;
use crate::categories;
use crate::error::{Result, StoreError};
use crate::filter::{compile_filter, PatchFilter};
use crate::migrations::{self, SCHEMA_VERSION};

/// File name of the default catalog.
pub const DATABASE_FILE_NAME: &str = "SysexDatabaseOfAllPatches.db3";

/// Which fields [`PatchDatabase::update_patch`] and the merge touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateFields(u32);

impl UpdateFields {
    pub const NONE: UpdateFields = UpdateFields(0);
    pub const NAME: UpdateFields = UpdateFields(1);
    pub const CATEGORIES: UpdateFields = UpdateFields(1 << 1);
    pub const HIDDEN: UpdateFields = UpdateFields(1 << 2);
    pub const DATA: UpdateFields = UpdateFields(1 << 3);
    pub const FAVORITE: UpdateFields = UpdateFields(1 << 4);
    pub const COMMENT: UpdateFields = UpdateFields(1 << 5);
    pub const AUTHOR: UpdateFields = UpdateFields(1 << 6);
    pub const INFO: UpdateFields = UpdateFields(1 << 7);
    pub const ALL: UpdateFields = UpdateFields(0xff);

    pub fn contains(self, other: UpdateFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: UpdateFields) -> UpdateFields {
        UpdateFields(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for UpdateFields {
    type Output = UpdateFields;

    fn bitor(self, rhs: UpdateFields) -> UpdateFields {
        UpdateFields(self.0 | rhs.0)
    }
}

/// Read-only or read-write catalog access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Outcome of a merge.
#[derive(Debug, Default, Clone)]
pub struct MergeReport {
    /// Patches newly inserted.
    pub inserted: usize,
    /// Existing rows that got a better name.
    pub updated_names: usize,
}

/// Id and display name of a stored list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInfo {
    pub id: String,
    pub name: String,
}

/// One import of a synth, with how many patches still trace back to it.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub id: String,
    pub name: String,
    pub patch_count: usize,
}

/// A list loaded back from the catalog, shaped by its stored type.
pub enum LoadedList {
    Normal(PatchList),
    Import(ImportList),
    SynthBank(SynthBank),
    UserBank(SynthBank),
}

/// The catalog.
pub struct PatchDatabase {
    conn: Mutex<Connection>,
    path: PathBuf,
    mode: OpenMode,
    registry: Arc<SynthRegistry>,
    bitfield: Mutex<CategoryBitfield>,
}

impl PatchDatabase {
    /// The default catalog location under the user's data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("KnobKraft")
            .join(DATABASE_FILE_NAME)
    }

    /// Open (and, in read-write mode, create/migrate) the catalog.
    pub fn open(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        registry: Arc<SynthRegistry>,
    ) -> Result<Self> {
        let path = path.into();
        if mode == OpenMode::ReadWrite {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Keep the backup set in shape before producing new ones.
            backup::trim_backups(&path)?;
        }

        let flags = match mode {
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = Connection::open_with_flags(&path, flags)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        let version = match mode {
            OpenMode::ReadWrite => migrations::create_schema(&conn)?,
            OpenMode::ReadOnly => migrations::read_schema_version(&conn)?.unwrap_or(0),
        };

        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaNewerThanSupported {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            if mode == OpenMode::ReadOnly {
                // Migrating would write; a read-only open cannot do that.
                return Err(StoreError::ReadOnly);
            }
            backup::backup_to(&conn, &backup::migration_backup_path(&path))?;
            migrations::migrate_schema(&conn, version)?;
        }

        let bitfield = categories::load_bitfield(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            mode,
            registry,
            bitfield: Mutex::new(bitfield),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn guard_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }

    fn bitfield(&self) -> CategoryBitfield {
        self.bitfield.lock().expect("category cache poisoned").clone()
    }

    fn reload_bitfield(&self, conn: &Connection) -> Result<()> {
        let fresh = categories::load_bitfield(conn)?;
        *self.bitfield.lock().expect("category cache poisoned") = fresh;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------

    /// Every category, active or not.
    pub fn get_categories(&self) -> Result<Vec<librarian::Category>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let all = categories::load_categories(&conn)?;
        self.reload_bitfield(&conn)?;
        Ok(all)
    }

    /// The bit assignment of the active categories.
    pub fn category_bitfield(&self) -> CategoryBitfield {
        self.bitfield()
    }

    pub fn next_category_bit_index(&self) -> Result<Option<u8>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        categories::next_bit_index(&conn)
    }

    pub fn update_categories(&self, definitions: &[librarian::Category]) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        categories::update_categories(&tx, definitions)?;
        tx.commit()?;
        self.reload_bitfield(&conn)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The number of patches the filter matches. Consistent with
    /// [`PatchDatabase::get_patches`] over the same filter.
    pub fn get_patches_count(&self, filter: &PatchFilter) -> Result<usize> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let compiled = compile_filter(filter, false);
        let sql = format!(
            "{}SELECT COUNT(*) FROM patches{} {}",
            compiled.cte, compiled.join, compiled.where_clause
        );
        let count: i64 =
            conn.query_row(&sql, compiled.bind_params().as_slice(), |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Query patches. `limit = -1` returns everything after `skip`.
    pub fn get_patches(
        &self,
        filter: &PatchFilter,
        skip: usize,
        limit: i64,
    ) -> Result<Vec<PatchHolder>> {
        let (holders, flagged) = self.get_patches_flagged(filter, skip, limit)?;
        if !flagged.is_empty() {
            warn!(
                count = flagged.len(),
                "found patches with inconsistent fingerprints, please reindex this synth"
            );
        }
        Ok(holders)
    }

    /// Query patches, also returning the stored fingerprints of rows whose
    /// recomputed fingerprint disagrees (candidates for reindexing).
    pub fn get_patches_flagged(
        &self,
        filter: &PatchFilter,
        skip: usize,
        limit: i64,
    ) -> Result<(Vec<PatchHolder>, Vec<String>)> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();
        query_patches(&conn, &self.registry, &bitfield, filter, skip, limit)
    }

    /// Run a query on a worker thread over a fresh read-only connection and
    /// hand the result to `callback`.
    pub fn get_patches_async<F>(&self, filter: PatchFilter, skip: usize, limit: i64, callback: F)
    where
        F: FnOnce(Result<Vec<PatchHolder>>) + Send + 'static,
    {
        let path = self.path.clone();
        let registry = Arc::clone(&self.registry);
        let bitfield = self.bitfield();
        thread::Builder::new()
            .name("catalog-query".to_string())
            .spawn(move || {
                let result = (|| -> Result<Vec<PatchHolder>> {
                    let conn =
                        Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
                    let (holders, _) =
                        query_patches(&conn, &registry, &bitfield, &filter, skip, limit)?;
                    Ok(holders)
                })();
                callback(result);
            })
            .map(|_| ())
            .unwrap_or_else(|e| error!("failed to spawn catalog query thread: {e}"));
    }

    /// Fetch one patch by its fingerprint.
    pub fn get_single_patch(&self, synth_name: &str, md5: &str) -> Result<Option<PatchHolder>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();
        get_single_patch(&conn, &self.registry, &bitfield, synth_name, md5)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Strict insert of one patch. Duplicate `(synth, fingerprint)` is a
    /// constraint error; merging is what [`PatchDatabase::merge_patches`]
    /// does.
    pub fn put_patch(&self, holder: &PatchHolder) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();
        insert_patch(&conn, &bitfield, holder)
    }

    /// Update fields of an existing patch under the merge policy.
    pub fn update_patch(
        &self,
        new_patch: &PatchHolder,
        existing: &PatchHolder,
        fields: UpdateFields,
    ) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();
        update_patch(&conn, &bitfield, new_patch, existing, fields)
    }

    /// Merge a batch of patches into the catalog: new fingerprints are
    /// inserted and grouped into one import list per provenance, existing
    /// ones are updated field by field. One transaction for the whole batch.
    pub fn merge_patches(
        &self,
        patches: &[PatchHolder],
        fields: UpdateFields,
    ) -> Result<MergeReport> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();
        let tx = conn.unchecked_transaction()?;
        let report = merge_patches_into(&tx, &self.registry, &bitfield, patches, fields, true)?;
        tx.commit()?;
        Ok(report)
    }

    /// Delete everything a filter matches, except that patches still
    /// referenced by a bank list are hidden instead. Returns
    /// `(deleted, hidden)`.
    pub fn delete_patches(&self, filter: &PatchFilter) -> Result<(usize, usize)> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        let compiled = compile_filter(filter, false);

        // Anything going away (or hidden) leaves the free-form lists first.
        let dup_join = if filter.only_duplicate_names {
            " INNER JOIN patches_count ON patches.synth = patches_count.synth \
             AND patches.name = patches_count.dup_name"
        } else {
            ""
        };
        let remove_from_lists = format!(
            "{}DELETE FROM patch_in_list WHERE ROWID IN (\
             SELECT patch_in_list.ROWID FROM patches \
             JOIN patch_in_list ON patches.md5 = patch_in_list.md5 AND patches.synth = patch_in_list.synth \
             JOIN lists ON lists.id = patch_in_list.id{} {} \
             AND lists.list_type = {})",
            compiled.cte,
            dup_join,
            compiled.where_clause,
            PatchListType::Normal as i64,
        );
        tx.execute(&remove_from_lists, compiled.bind_params().as_slice())?;

        // Still sitting in a bank: only hide.
        let hide = format!(
            "{}UPDATE patches SET hidden = 1 WHERE ROWID IN (\
             SELECT patches.ROWID FROM patches \
             JOIN patch_in_list ON patches.md5 = patch_in_list.md5 AND patches.synth = patch_in_list.synth \
             JOIN lists ON lists.id = patch_in_list.id{} {} \
             AND lists.list_type IN ({}, {}))",
            compiled.cte,
            dup_join,
            compiled.where_clause,
            PatchListType::SynthBank as i64,
            PatchListType::UserBank as i64,
        );
        let hidden = tx.execute(&hide, compiled.bind_params().as_slice())?;

        // The rest goes away for real: anything matching that no bank list
        // still references.
        let list_join = if filter.import_id.is_some() || filter.list_id.is_some() {
            " INNER JOIN patch_in_list ON patches.md5 = patch_in_list.md5 \
             AND patches.synth = patch_in_list.synth"
        } else {
            ""
        };
        let candidates = format!(
            "SELECT patches.ROWID FROM patches \
             LEFT JOIN (SELECT pil.synth AS synth, pil.md5 AS md5 FROM patch_in_list pil \
                        JOIN lists ON lists.id = pil.id \
                        WHERE lists.list_type IN ({}, {})) AS bank_refs \
             ON patches.synth = bank_refs.synth AND patches.md5 = bank_refs.md5{}{} {} \
             AND bank_refs.md5 IS NULL",
            PatchListType::SynthBank as i64,
            PatchListType::UserBank as i64,
            list_join,
            dup_join,
            compiled.where_clause,
        );
        // Their remaining list entries (import lists in particular) must go
        // first, the foreign key would reject deleting referenced rows.
        let release_membership = format!(
            "{}DELETE FROM patch_in_list WHERE ROWID IN (\
             SELECT member.ROWID FROM patch_in_list AS member \
             JOIN patches ON patches.synth = member.synth AND patches.md5 = member.md5 \
             WHERE patches.ROWID IN ({candidates}))",
            compiled.cte,
        );
        tx.execute(&release_membership, compiled.bind_params().as_slice())?;
        let delete = format!(
            "{}DELETE FROM patches WHERE ROWID IN ({candidates})",
            compiled.cte
        );
        let deleted = tx.execute(&delete, compiled.bind_params().as_slice())?;

        remove_orphans(&tx)?;
        tx.commit()?;
        info!(deleted, hidden, "deleted patches via filter");
        Ok((deleted, hidden))
    }

    /// Delete specific patches by fingerprint; bank members degrade to
    /// hidden. Returns `(deleted, hidden)`.
    pub fn delete_patches_by_md5(
        &self,
        synth_name: &str,
        md5s: &[String],
    ) -> Result<(usize, usize)> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        let result = delete_by_md5(&tx, synth_name, md5s)?;
        remove_orphans(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Recompute fingerprints after an adapter changed its algorithm:
    /// reinsert under the new fingerprint, rewrite list references, delete
    /// the stale rows. Single-synth filters only; everything in one
    /// transaction with a count check before committing.
    pub fn reindex_patches(&self, filter: &PatchFilter) -> Result<usize> {
        self.guard_writable()?;
        if filter.synths.len() != 1 {
            return Err(StoreError::NotASingleSynth(filter.synths.len()));
        }
        let synth_name = filter.synths[0].clone();

        let (_, flagged) = self.get_patches_flagged(filter, 0, -1)?;
        if flagged.is_empty() {
            info!("none of the selected patches needed reindexing, skipping");
            return self.get_patches_count(filter);
        }

        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();

        // Load the full rows of everything flagged (they carry the new
        // fingerprints after the round trip through the adapter).
        let mut stale_md5s = Vec::new();
        let mut reinserts = Vec::new();
        for stored_md5 in &flagged {
            if let Some(holder) =
                get_single_patch(&conn, &self.registry, &bitfield, &synth_name, stored_md5)?
            {
                stale_md5s.push(stored_md5.clone());
                reinserts.push(holder);
            }
        }

        let tx = conn.unchecked_transaction()?;
        // No fresh import lists here: the existing membership rows are
        // re-pointed below, which keeps the historical provenance intact.
        merge_patches_into(&tx, &self.registry, &bitfield, &reinserts, UpdateFields::ALL, false)?;

        // Re-point list entries at the new fingerprints.
        for (stale, holder) in stale_md5s.iter().zip(&reinserts) {
            let Some(new_md5) = holder.fingerprint() else {
                continue;
            };
            let mut stmt = tx.prepare(
                "UPDATE patch_in_list SET md5 = :new WHERE synth = :syn AND md5 = :old",
            )?;
            let updated = stmt.execute(rusqlite::named_params! {
                ":new": new_md5.as_str(),
                ":syn": synth_name,
                ":old": stale,
            })?;
            if updated > 0 {
                debug!(old = %stale, new = %new_md5, updated, "re-pointed list entries");
            }
        }

        // Delete the stale rows; every reindexed patch must account for
        // exactly one deletion or the whole operation rolls back.
        let mut deleted = 0usize;
        {
            let mut stmt = tx.prepare("DELETE FROM patches WHERE synth = :syn AND md5 = :md5")?;
            for stale in &stale_md5s {
                deleted += stmt.execute(rusqlite::named_params! {
                    ":syn": synth_name,
                    ":md5": stale,
                })?;
            }
        }
        if deleted != stale_md5s.len() {
            // Dropping the transaction rolls everything back.
            return Err(StoreError::ReindexMismatch {
                rewritten: stale_md5s.len(),
                deleted,
            });
        }
        remove_orphans(&tx)?;
        tx.commit()?;
        drop(conn);
        self.get_patches_count(filter)
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// Store a free-form list, overwriting any previous content under the
    /// same id.
    pub fn put_patch_list(&self, list: &PatchList) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        upsert_list_row(&tx, list.id(), list.name(), None, None, None, PatchListType::Normal)?;
        replace_list_members(&tx, list.id(), list.patches())?;
        tx.commit()?;
        Ok(())
    }

    /// Store a bank (synth bank or user bank by `list_type`).
    pub fn put_synth_bank(&self, bank: &SynthBank, list_type: PatchListType) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        let last_synced = bank.last_synced().map(|t| t.timestamp_millis()).unwrap_or(0);
        upsert_list_row(
            &tx,
            bank.id(),
            bank.name(),
            Some(&bank.synth().name()),
            Some(bank.bank().index() as i64),
            Some(last_synced),
            list_type,
        )?;
        // Only slots with real patches are stored; the bank pads itself back
        // to size on load.
        let real: Vec<PatchHolder> = bank
            .patches()
            .iter()
            .filter(|holder| holder.has_patch())
            .cloned()
            .collect();
        replace_list_members(&tx, bank.id(), &real)?;
        tx.commit()?;
        Ok(())
    }

    /// Load any list by id, reconstructing its stored shape.
    pub fn get_patch_list(&self, id: &str) -> Result<Option<LoadedList>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let bitfield = self.bitfield();

        let row = conn
            .query_row(
                "SELECT id, name, synth, midi_bank_number, last_synced, list_type \
                 FROM lists WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((list_id, name, synth_name, bank_number, last_synced, list_type)) = row else {
            return Ok(None);
        };

        let members = load_list_members(&conn, &self.registry, &bitfield, &list_id)?;
        match PatchListType::from_stored(list_type) {
            Some(PatchListType::Normal) | None => {
                let mut list = PatchList::with_id(list_id, name);
                list.set_patches(members);
                Ok(Some(LoadedList::Normal(list)))
            }
            Some(PatchListType::Import) => {
                let synth_name = synth_name.unwrap_or_default();
                let mut list = ImportList::new(synth_name, list_id, name);
                list.set_patches(members);
                Ok(Some(LoadedList::Import(list)))
            }
            Some(bank_type @ (PatchListType::SynthBank | PatchListType::UserBank)) => {
                let synth_name = synth_name.unwrap_or_default();
                let Some(synth) = self.registry.find(&synth_name) else {
                    error!(synth = %synth_name, "can't load bank of a synth that is not configured");
                    return Err(StoreError::MissingSynth(synth_name));
                };
                let bank_index = bank_number.unwrap_or(0).max(0) as u32;
                let size = synth::bank_size(&*synth, bank_index).unwrap_or(members.len() as u32);
                let mut bank =
                    SynthBank::with_id(list_id, name, synth, BankNumber::new(bank_index, size));
                let synced = last_synced.filter(|&ms| ms > 0).and_then(timestamp_from_millis);
                bank.set_last_synced(synced);
                bank.set_patches(members)
                    .map_err(|e| {
                        error!("stored bank fails validation: {e}");
                        StoreError::MissingList(id.to_string())
                    })?;
                Ok(Some(match bank_type {
                    PatchListType::SynthBank => LoadedList::SynthBank(bank),
                    _ => LoadedList::UserBank(bank),
                }))
            }
        }
    }

    pub fn does_list_exist(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lists WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All free-form lists.
    pub fn all_patch_lists(&self) -> Result<Vec<ListInfo>> {
        self.list_infos_by_type(PatchListType::Normal, None)
    }

    pub fn all_synth_banks(&self, synth_name: &str) -> Result<Vec<ListInfo>> {
        self.list_infos_by_type(PatchListType::SynthBank, Some(synth_name))
    }

    pub fn all_user_banks(&self, synth_name: &str) -> Result<Vec<ListInfo>> {
        self.list_infos_by_type(PatchListType::UserBank, Some(synth_name))
    }

    fn list_infos_by_type(
        &self,
        list_type: PatchListType,
        synth_name: Option<&str>,
    ) -> Result<Vec<ListInfo>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut result = Vec::new();
        match synth_name {
            Some(synth_name) => {
                let mut stmt = conn.prepare(
                    "SELECT id, name FROM lists WHERE list_type = ?1 AND synth = ?2 ORDER BY name",
                )?;
                let rows = stmt.query_map((list_type as i64, synth_name), |row| {
                    Ok(ListInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?;
                for row in rows {
                    result.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT id, name FROM lists WHERE list_type = ?1 ORDER BY name")?;
                let rows = stmt.query_map([list_type as i64], |row| {
                    Ok(ListInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?;
                for row in rows {
                    result.push(row?);
                }
            }
        }
        Ok(result)
    }

    /// The imports of a synth with their surviving patch counts, oldest
    /// first.
    pub fn imports_for_synth(&self, synth_name: &str) -> Result<Vec<ImportInfo>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT lists.id, lists.name, COUNT(pil.md5) \
             FROM lists LEFT JOIN patch_in_list AS pil ON lists.id = pil.id \
             WHERE lists.list_type = ?1 AND lists.synth = ?2 \
             GROUP BY lists.id ORDER BY lists.ROWID",
        )?;
        let rows = stmt.query_map((PatchListType::Import as i64, synth_name), |row| {
            Ok(ImportInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                patch_count: row.get::<_, i64>(2)? as usize,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn rename_import(&self, synth_name: &str, import_id: &str, new_name: &str) -> Result<bool> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let updated = conn.execute(
            "UPDATE lists SET name = ?1 WHERE id = ?2 AND synth = ?3",
            (new_name, import_id, synth_name),
        )?;
        if updated == 0 {
            error!(import = import_id, "failed to rename import, not found");
        }
        Ok(updated == 1)
    }

    /// Insert a patch into a list at the given position, shifting what
    /// follows.
    pub fn add_patch_to_list(
        &self,
        list_id: &str,
        holder: &PatchHolder,
        index: usize,
    ) -> Result<()> {
        self.guard_writable()?;
        let Some(md5) = holder.fingerprint() else {
            return Ok(());
        };
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE patch_in_list SET order_num = order_num + 1 WHERE id = ?1 AND order_num >= ?2",
            (list_id, index as i64),
        )?;
        tx.execute(
            "INSERT INTO patch_in_list (id, synth, md5, order_num) VALUES (?1, ?2, ?3, ?4)",
            (list_id, holder.synth_name(), md5.as_str(), index as i64),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Move a patch within a list from one position to another.
    pub fn move_patch_in_list(
        &self,
        list_id: &str,
        holder: &PatchHolder,
        previous_index: usize,
        new_index: usize,
    ) -> Result<()> {
        self.guard_writable()?;
        let Some(md5) = holder.fingerprint() else {
            return Ok(());
        };
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE patch_in_list SET order_num = order_num + 1 WHERE id = ?1 AND order_num >= ?2",
            (list_id, new_index as i64),
        )?;
        let shifted_previous = if new_index > previous_index {
            previous_index
        } else {
            previous_index + 1
        };
        tx.execute(
            "UPDATE patch_in_list SET order_num = ?1 \
             WHERE id = ?2 AND synth = ?3 AND md5 = ?4 AND order_num = ?5",
            (
                new_index as i64,
                list_id,
                holder.synth_name(),
                md5.as_str(),
                shifted_previous as i64,
            ),
        )?;
        renumber_list(&tx, list_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_patch_from_list(
        &self,
        list_id: &str,
        synth_name: &str,
        md5: &str,
        order_num: usize,
    ) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM patch_in_list WHERE id = ?1 AND synth = ?2 AND md5 = ?3 AND order_num = ?4",
            (list_id, synth_name, md5, order_num as i64),
        )?;
        renumber_list(&tx, list_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Drop a list with its membership.
    pub fn delete_patch_list(&self, id: &str) -> Result<()> {
        self.guard_writable()?;
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM patch_in_list WHERE id = ?1", [id])?;
        tx.execute("DELETE FROM lists WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    /// Every list (of any kind) containing a patch.
    pub fn lists_for_patch(&self, synth_name: &str, md5: &str) -> Result<Vec<ListInfo>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT lists.id, lists.name FROM lists \
             INNER JOIN patch_in_list AS pil ON lists.id = pil.id \
             WHERE pil.synth = ?1 AND pil.md5 = ?2",
        )?;
        let rows = stmt.query_map((synth_name, md5), |row| {
            Ok(ListInfo {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Synced bank positions a patch occupies on the instrument.
    pub fn bank_positions(&self, synth_name: &str, md5: &str) -> Result<Vec<ProgramNumber>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT lists.midi_bank_number, pil.order_num FROM lists \
             JOIN patch_in_list AS pil ON lists.id = pil.id \
             WHERE pil.md5 = ?1 AND lists.synth = ?2 \
             AND lists.last_synced IS NOT NULL AND lists.last_synced > 0 \
             AND lists.midi_bank_number IS NOT NULL",
        )?;
        let rows = stmt.query_map((md5, synth_name), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let synth = self.registry.find(synth_name);
        let mut result = Vec::new();
        for row in rows {
            let (bank_index, order_num) = row?;
            let bank_index = bank_index.max(0) as u32;
            let Some(size) = synth
                .as_ref()
                .and_then(|s| synth::bank_size(&**s, bank_index))
            else {
                error!(
                    synth = synth_name,
                    bank = bank_index,
                    "stored bank number is out of range for the synth's descriptors"
                );
                continue;
            };
            result.push(ProgramNumber::with_bank(
                BankNumber::new(bank_index, size),
                order_num.max(0) as u32,
            ));
        }
        Ok(result)
    }

    /// Make a backup at an explicit path, overwriting in place.
    pub fn backup_to(&self, target: &Path) -> Result<()> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        backup::backup_to(&conn, target)
    }
}

impl Drop for PatchDatabase {
    fn drop(&mut self) {
        if self.mode == OpenMode::ReadWrite {
            let conn = self.conn.lock().expect("catalog connection poisoned");
            let target = backup::next_backup_path(&self.path);
            if let Err(e) = backup::backup_to(&conn, &target) {
                error!("failed to write close-time catalog backup: {e}");
            }
        }
    }
}

fn timestamp_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// ----------------------------------------------------------------------
// Row plumbing shared by the owning connection and background queries
// ----------------------------------------------------------------------

fn holder_from_row(
    registry: &SynthRegistry,
    bitfield: &CategoryBitfield,
    row: &Row<'_>,
) -> Result<Option<(PatchHolder, String)>> {
    let synth_name: String = row.get("synth")?;
    let stored_md5: String = row.get("md5")?;
    let Some(synth) = registry.find(&synth_name) else {
        warn!(synth = %synth_name, "query returned patch for a synth that is not configured");
        return Ok(None);
    };

    let data: Vec<u8> = row.get("data")?;
    let data_type: i64 = row.get::<_, Option<i64>>("type")?.unwrap_or(0);
    let patch = synth.patch_from_data(data_type as i32, data);

    let source = row
        .get::<_, Option<String>>("source_info")?
        .as_deref()
        .and_then(SourceInfo::from_string_rep);
    let mut holder = PatchHolder::new(&synth, source, Some(patch));

    if let Some(name) = row.get::<_, Option<String>>("name")? {
        holder.set_name(&name);
    }
    holder.favorite = Favorite::from_stored(row.get::<_, Option<i64>>("favorite")?.unwrap_or(-1));
    holder.hidden = row.get::<_, Option<i64>>("hidden")?.unwrap_or(0) == 1;
    holder.regular = row.get::<_, Option<i64>>("regular")?.unwrap_or(0) == 1;

    let bank = row
        .get::<_, Option<i64>>("midi_bank_no")?
        .map(|index| {
            let index = index.max(0) as u32;
            let size = synth::bank_size(&*synth, index).unwrap_or(0);
            BankNumber::new(index, size)
        });
    holder.bank = bank;
    if let Some(program) = row.get::<_, Option<i64>>("midi_program_no")? {
        holder.program = Some(match bank {
            Some(bank) => ProgramNumber::with_bank(bank, program.max(0) as u32),
            None => ProgramNumber::from_zero_based(program.max(0) as u32),
        });
    }

    let category_mask: i64 = row.get::<_, Option<i64>>("categories")?.unwrap_or(0);
    holder.set_categories(bitfield.set_from_bitfield(category_mask));
    let decision_mask: i64 = row
        .get::<_, Option<i64>>("category_user_decision")?
        .unwrap_or(0);
    holder.set_user_decisions(bitfield.set_from_bitfield(decision_mask));

    holder.comment = row.get::<_, Option<String>>("comment")?.unwrap_or_default();
    holder.author = row.get::<_, Option<String>>("author")?.unwrap_or_default();
    holder.info = row.get::<_, Option<String>>("info")?.unwrap_or_default();

    Ok(Some((holder, stored_md5)))
}

fn query_patches(
    conn: &Connection,
    registry: &SynthRegistry,
    bitfield: &CategoryBitfield,
    filter: &PatchFilter,
    skip: usize,
    limit: i64,
) -> Result<(Vec<PatchHolder>, Vec<String>)> {
    let mut compiled = compile_filter(filter, true);
    let mut sql = format!(
        "{}SELECT patches.* FROM patches{} {}{}",
        compiled.cte, compiled.join, compiled.where_clause, compiled.order_clause
    );
    if limit >= 0 {
        sql.push_str(" LIMIT :lim OFFSET :ofs");
        compiled
            .params
            .push((":lim".to_string(), rusqlite::types::Value::Integer(limit)));
        compiled
            .params
            .push((":ofs".to_string(), rusqlite::types::Value::Integer(skip as i64)));
    }
    debug!(sql = %sql, "patch query");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(compiled.bind_params().as_slice())?;
    let mut holders = Vec::new();
    let mut needs_reindex = Vec::new();
    while let Some(row) = rows.next()? {
        if let Some((holder, stored_md5)) = holder_from_row(registry, bitfield, row)? {
            if holder
                .fingerprint()
                .map(|fp| fp.as_str() != stored_md5)
                .unwrap_or(false)
            {
                needs_reindex.push(stored_md5);
            }
            holders.push(holder);
        }
    }
    Ok((holders, needs_reindex))
}

fn get_single_patch(
    conn: &Connection,
    registry: &SynthRegistry,
    bitfield: &CategoryBitfield,
    synth_name: &str,
    md5: &str,
) -> Result<Option<PatchHolder>> {
    let mut stmt = conn.prepare("SELECT * FROM patches WHERE synth = ?1 AND md5 = ?2")?;
    let mut rows = stmt.query((synth_name, md5))?;
    match rows.next()? {
        Some(row) => Ok(holder_from_row(registry, bitfield, row)?.map(|(holder, _)| holder)),
        None => Ok(None),
    }
}

fn insert_patch(conn: &Connection, bitfield: &CategoryBitfield, holder: &PatchHolder) -> Result<()> {
    let Some(patch) = holder.patch() else {
        warn!(name = holder.name(), "refusing to insert a holder without patch data");
        return Ok(());
    };
    let Some(md5) = holder.fingerprint() else {
        warn!(name = holder.name(), "refusing to insert a holder without fingerprint");
        return Ok(());
    };
    let synth = holder.synth();
    let bank_name = holder
        .bank
        .zip(synth.as_ref())
        .map(|(bank, synth)| synth::friendly_bank_name(&**synth, bank.index()));
    let source_name = holder
        .source()
        .map(|s| s.display_string(bank_name.as_deref()));
    let source_info = holder.source().map(|s| s.to_string_rep());

    conn.execute(
        "INSERT INTO patches (synth, md5, name, type, data, favorite, regular, hidden, \
         source_name, source_info, midi_bank_no, midi_program_no, categories, \
         category_user_decision, comment, author, info) \
         VALUES (:syn, :md5, :nam, :typ, :dat, :fav, :reg, :hid, :snm, :src, :bnk, :prg, :cat, \
         :cud, :com, :aut, :inf)",
        rusqlite::named_params! {
            ":syn": holder.synth_name(),
            ":md5": md5.as_str(),
            ":nam": holder.name(),
            ":typ": holder.data_type_id() as i64,
            ":dat": patch.data(),
            ":fav": holder.favorite.to_stored(),
            ":reg": holder.regular as i64,
            ":hid": holder.hidden as i64,
            ":snm": source_name,
            ":src": source_info,
            ":bnk": holder.bank.map(|b| b.index() as i64),
            // With a known bank the program is stored bank-relative, the
            // loader recombines the two.
            ":prg": holder.program.map(|p| if holder.bank.is_some() {
                p.to_zero_based_discarding_bank() as i64
            } else {
                p.to_zero_based_with_bank() as i64
            }),
            ":cat": bitfield.set_as_bitfield(holder.categories()),
            ":cud": bitfield.set_as_bitfield(holder.user_decisions()),
            ":com": holder.comment,
            ":aut": holder.author,
            ":inf": holder.info,
        },
    )?;
    Ok(())
}

/// The category merge of two generations of the same patch: user decisions
/// win, fresh automatic tags only fill the gaps the old user decisions left.
fn merge_categories(new_patch: &PatchHolder, existing: &PatchHolder) -> (librarian::CategorySet, librarian::CategorySet) {
    let new_user_decided: librarian::CategorySet = new_patch
        .categories()
        .intersection(new_patch.user_decisions())
        .copied()
        .collect();
    let new_automatic: librarian::CategorySet = new_patch
        .categories()
        .difference(new_patch.user_decisions())
        .copied()
        .collect();
    let old_user_decided: librarian::CategorySet = existing
        .categories()
        .intersection(existing.user_decisions())
        .copied()
        .collect();

    let automatic_without_old_override: librarian::CategorySet = new_automatic
        .difference(existing.user_decisions())
        .copied()
        .collect();
    let old_decided_without_new_override: librarian::CategorySet = old_user_decided
        .difference(new_patch.user_decisions())
        .copied()
        .collect();

    let mut merged = new_user_decided;
    merged.extend(automatic_without_old_override);
    merged.extend(old_decided_without_new_override);

    let mut decisions = new_patch.user_decisions().clone();
    decisions.extend(existing.user_decisions().iter().copied());
    (merged, decisions)
}

fn update_patch(
    conn: &Connection,
    bitfield: &CategoryBitfield,
    new_patch: &PatchHolder,
    existing: &PatchHolder,
    fields: UpdateFields,
) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let Some(md5) = new_patch.fingerprint() else {
        return Ok(());
    };

    let mut set_clauses: Vec<&str> = Vec::new();
    if fields.contains(UpdateFields::CATEGORIES) {
        set_clauses.push("categories = :cat, category_user_decision = :cud");
    }
    if fields.contains(UpdateFields::NAME) {
        set_clauses.push("name = :nam");
    }
    if fields.contains(UpdateFields::HIDDEN) {
        set_clauses.push("hidden = :hid");
    }
    if fields.contains(UpdateFields::DATA) {
        set_clauses.push("data = :dat");
    }
    if fields.contains(UpdateFields::FAVORITE) {
        set_clauses.push("favorite = :fav");
    }
    if fields.contains(UpdateFields::COMMENT) {
        set_clauses.push("comment = :com");
    }
    if fields.contains(UpdateFields::AUTHOR) {
        set_clauses.push("author = :aut");
    }
    if fields.contains(UpdateFields::INFO) {
        set_clauses.push("info = :inf");
    }

    let sql = format!(
        "UPDATE patches SET {} WHERE synth = :syn AND md5 = :md5",
        set_clauses.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;

    // Merge policies: favorite keeps the stored value when the incoming one
    // is unknown; empty incoming text fields keep the stored text.
    let favorite = match new_patch.favorite {
        Favorite::Unknown => existing.favorite,
        decided => decided,
    };
    let comment = if new_patch.comment.is_empty() {
        &existing.comment
    } else {
        &new_patch.comment
    };
    let author = if new_patch.author.is_empty() {
        &existing.author
    } else {
        &new_patch.author
    };
    let info = if new_patch.info.is_empty() {
        &existing.info
    } else {
        &new_patch.info
    };
    let (categories, decisions) = merge_categories(new_patch, existing);

    let mut params: Vec<(&str, rusqlite::types::Value)> = vec![
        (":syn", new_patch.synth_name().to_string().into()),
        (":md5", md5.as_str().to_string().into()),
    ];
    if fields.contains(UpdateFields::CATEGORIES) {
        params.push((":cat", bitfield.set_as_bitfield(&categories).into()));
        params.push((":cud", bitfield.set_as_bitfield(&decisions).into()));
    }
    if fields.contains(UpdateFields::NAME) {
        params.push((":nam", new_patch.name().to_string().into()));
    }
    if fields.contains(UpdateFields::HIDDEN) {
        params.push((":hid", (new_patch.hidden as i64).into()));
    }
    if fields.contains(UpdateFields::DATA) {
        let data = new_patch.patch().map(|p| p.data().to_vec()).unwrap_or_default();
        params.push((":dat", data.into()));
    }
    if fields.contains(UpdateFields::FAVORITE) {
        params.push((":fav", favorite.to_stored().into()));
    }
    if fields.contains(UpdateFields::COMMENT) {
        params.push((":com", comment.clone().into()));
    }
    if fields.contains(UpdateFields::AUTHOR) {
        params.push((":aut", author.clone().into()));
    }
    if fields.contains(UpdateFields::INFO) {
        params.push((":inf", info.clone().into()));
    }

    let bind: Vec<(&str, &dyn rusqlite::ToSql)> = params
        .iter()
        .map(|(name, value)| (*name, value as &dyn rusqlite::ToSql))
        .collect();
    stmt.execute(bind.as_slice())?;
    Ok(())
}

/// The heart of the import path; composes into an outer transaction.
/// `create_import_lists` is off when reindexing, which preserves the
/// existing membership rows instead.
fn merge_patches_into(
    conn: &Connection,
    registry: &SynthRegistry,
    bitfield: &CategoryBitfield,
    patches: &[PatchHolder],
    fields: UpdateFields,
    create_import_lists: bool,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();

    // Bulk-fetch what already exists, keyed by (synth, fingerprint).
    let mut known: HashMap<(String, String), PatchHolder> = HashMap::new();
    for holder in patches {
        let Some(md5) = holder.fingerprint() else {
            continue;
        };
        let key = (holder.synth_name().to_string(), md5.as_str().to_string());
        if known.contains_key(&key) {
            continue;
        }
        if let Some(existing) =
            get_single_patch(conn, registry, bitfield, holder.synth_name(), md5.as_str())?
        {
            known.insert(key, existing);
        }
    }

    let mut new_patches: Vec<&PatchHolder> = Vec::new();
    for holder in patches {
        let Some(md5) = holder.fingerprint() else {
            warn!(name = holder.name(), "skipping holder without fingerprint in merge");
            continue;
        };
        let key = (holder.synth_name().to_string(), md5.as_str().to_string());
        if let Some(existing) = known.get(&key) {
            // Never let a factory placeholder name overwrite a given name.
            let mut effective = fields;
            if holder.has_default_name() {
                effective = effective.without(UpdateFields::NAME);
            }
            if effective.contains(UpdateFields::NAME) && holder.name() != existing.name() {
                info!(
                    old = existing.name(),
                    new = holder.name(),
                    "renaming patch with better name"
                );
                report.updated_names += 1;
            }
            update_patch(conn, bitfield, holder, existing, effective)?;
        } else {
            new_patches.push(holder);
        }
    }
    if report.updated_names > 0 {
        info!(count = report.updated_names, "updated patches with new names");
    }

    // Inside the batch the same fingerprint may appear more than once; keep
    // one instance, preferring a properly named one over a default name.
    let mut inserted: HashMap<(String, String), PatchHolder> = HashMap::new();
    let mut insertion_order: Vec<(String, String)> = Vec::new();
    for holder in new_patches {
        let Some(md5) = holder.fingerprint() else {
            continue;
        };
        let key = (holder.synth_name().to_string(), md5.as_str().to_string());
        match inserted.get(&key) {
            Some(duplicate) => {
                if duplicate.has_default_name() && !holder.has_default_name() {
                    info!(
                        old = duplicate.name(),
                        new = holder.name(),
                        "duplicate in batch carries a better name"
                    );
                    inserted.insert(key, holder.clone());
                } else {
                    debug!(
                        name = holder.name(),
                        duplicate = duplicate.name(),
                        "skipping duplicate patch in batch"
                    );
                }
            }
            None => {
                inserted.insert(key.clone(), holder.clone());
                insertion_order.push(key);
            }
        }
    }

    // Group the inserts into one import list per provenance.
    let mut import_lists: HashMap<String, (String, String, Vec<String>)> = HashMap::new();
    for key in &insertion_order {
        let holder = &inserted[key];
        insert_patch(conn, bitfield, holder)?;
        report.inserted += 1;

        if !create_import_lists {
            continue;
        }
        let Some(source) = holder.source() else {
            // Very old data or third-party imports carry no source info.
            continue;
        };
        let bank_name = holder.bank.zip(holder.synth()).map(|(bank, synth)| {
            synth::friendly_bank_name(&*synth, bank.index())
        });
        let import_id = format!(
            "import:{}:{}",
            holder.synth_name(),
            source.import_id()
        );
        let entry = import_lists.entry(import_id).or_insert_with(|| {
            (
                holder.synth_name().to_string(),
                source.display_string(bank_name.as_deref()),
                Vec::new(),
            )
        });
        entry.2.push(key.1.clone());
    }

    for (import_id, (synth_name, display_name, md5s)) in import_lists {
        upsert_list_row(
            conn,
            &import_id,
            &display_name,
            Some(&synth_name),
            None,
            None,
            PatchListType::Import,
        )?;
        let mut next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_num) + 1, 0) FROM patch_in_list WHERE id = ?1",
            [&import_id],
            |row| row.get(0),
        )?;
        let mut insert = conn.prepare(
            "INSERT INTO patch_in_list (id, synth, md5, order_num) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for md5 in md5s {
            insert.execute((&import_id, &synth_name, &md5, next))?;
            next += 1;
        }
    }

    Ok(report)
}

fn delete_by_md5(conn: &Connection, synth_name: &str, md5s: &[String]) -> Result<(usize, usize)> {
    let mut deleted = 0usize;
    let mut hidden = 0usize;
    for md5 in md5s {
        // Free-form lists let go of the patch either way.
        conn.execute(
            "DELETE FROM patch_in_list WHERE synth = ?1 AND md5 = ?2 AND EXISTS (\
             SELECT * FROM lists WHERE id = patch_in_list.id AND list_type = ?3)",
            (synth_name, md5, PatchListType::Normal as i64),
        )?;

        let in_bank: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lists INNER JOIN patch_in_list AS pil ON lists.id = pil.id \
             WHERE lists.synth = ?1 AND pil.md5 = ?2 AND lists.list_type IN (?3, ?4)",
            (
                synth_name,
                md5,
                PatchListType::SynthBank as i64,
                PatchListType::UserBank as i64,
            ),
            |row| row.get(0),
        )?;
        if in_bank > 0 {
            hidden += conn.execute(
                "UPDATE patches SET hidden = 1 WHERE synth = ?1 AND md5 = ?2",
                (synth_name, md5),
            )?;
        } else {
            // Release the remaining memberships (import lists), the foreign
            // key protects referenced rows.
            conn.execute(
                "DELETE FROM patch_in_list WHERE synth = ?1 AND md5 = ?2",
                (synth_name, md5),
            )?;
            deleted += conn.execute(
                "DELETE FROM patches WHERE synth = ?1 AND md5 = ?2",
                (synth_name, md5),
            )?;
        }
    }
    Ok((deleted, hidden))
}

fn remove_orphans(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM patch_in_list AS pil WHERE NOT EXISTS (\
         SELECT * FROM patches AS p WHERE p.md5 = pil.md5 AND p.synth = pil.synth)",
        [],
    )?;
    Ok(())
}

fn renumber_list(conn: &Connection, list_id: &str) -> Result<()> {
    conn.execute(
        "WITH po AS (SELECT *, ROW_NUMBER() OVER (ORDER BY order_num) - 1 AS new_order \
         FROM patch_in_list WHERE id = :id) \
         UPDATE patch_in_list AS pl SET order_num = (\
         SELECT new_order FROM po WHERE pl.synth = po.synth AND pl.md5 = po.md5 \
         AND pl.order_num = po.order_num) WHERE id = :id",
        rusqlite::named_params! { ":id": list_id },
    )?;
    Ok(())
}

fn upsert_list_row(
    conn: &Connection,
    id: &str,
    name: &str,
    synth: Option<&str>,
    bank_number: Option<i64>,
    last_synced: Option<i64>,
    list_type: PatchListType,
) -> Result<()> {
    let exists: i64 = conn.query_row("SELECT COUNT(*) FROM lists WHERE id = ?1", [id], |row| {
        row.get(0)
    })?;
    if exists > 0 {
        conn.execute(
            "UPDATE lists SET name = ?1, last_synced = COALESCE(?2, last_synced) WHERE id = ?3",
            (name, last_synced, id),
        )?;
    } else {
        conn.execute(
            "INSERT INTO lists (id, name, synth, midi_bank_number, last_synced, list_type) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (id, name, synth, bank_number, last_synced, list_type as i64),
        )?;
    }
    Ok(())
}

fn replace_list_members(conn: &Connection, list_id: &str, patches: &[PatchHolder]) -> Result<()> {
    conn.execute("DELETE FROM patch_in_list WHERE id = ?1", [list_id])?;
    let mut insert = conn.prepare(
        "INSERT INTO patch_in_list (id, synth, md5, order_num) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut order: i64 = 0;
    for holder in patches {
        let Some(md5) = holder.fingerprint() else {
            continue;
        };
        insert.execute((list_id, holder.synth_name(), md5.as_str(), order))?;
        order += 1;
    }
    Ok(())
}

fn load_list_members(
    conn: &Connection,
    registry: &SynthRegistry,
    bitfield: &CategoryBitfield,
    list_id: &str,
) -> Result<Vec<PatchHolder>> {
    let mut stmt = conn.prepare(
        "SELECT synth, md5 FROM patch_in_list WHERE id = ?1 ORDER BY order_num",
    )?;
    let rows = stmt.query_map([list_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut members = Vec::new();
    for row in rows {
        let (synth_name, md5) = row?;
        if let Some(holder) = get_single_patch(conn, registry, bitfield, &synth_name, &md5)? {
            members.push(holder);
        }
    }
    Ok(members)
}
