//! Automatic catalog backups.
//!
//! Read-write catalogs produce a timestamped `-backup` sibling on close and
//! a `-before-migration` sibling before the first migration step. On open,
//! the backup set is trimmed: at least the newest three are kept, everything
//! beyond roughly 500 MB total goes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::{error, info};

use crate::error::Result;

/// Suffix of the automatic close-time backups.
pub const BACKUP_SUFFIX: &str = "-backup";
/// Suffix of the one-shot pre-migration backup.
pub const MIGRATION_BACKUP_SUFFIX: &str = "-before-migration";

const MAX_BACKUP_BYTES: u64 = 500_000_000;
const MIN_BACKUPS_KEPT: usize = 3;

fn stem_and_extension(database: &Path) -> (String, String) {
    let stem = database
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    let extension = database
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, extension)
}

/// Path of a fresh timestamped close-time backup next to the database.
pub fn next_backup_path(database: &Path) -> PathBuf {
    let (stem, extension) = stem_and_extension(database);
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    database.with_file_name(format!("{stem}{BACKUP_SUFFIX}-{stamp}{extension}"))
}

/// Path of the pre-migration protection copy.
pub fn migration_backup_path(database: &Path) -> PathBuf {
    let (stem, extension) = stem_and_extension(database);
    database.with_file_name(format!("{stem}{MIGRATION_BACKUP_SUFFIX}{extension}"))
}

/// Copy the live database into `target`, overwriting whatever is there.
pub fn backup_to(conn: &Connection, target: &Path) -> Result<()> {
    if target.exists() {
        fs::remove_file(target)?;
    }
    let mut destination = Connection::open(target)?;
    let backup = Backup::new(conn, &mut destination)?;
    backup.run_to_completion(100, std::time::Duration::from_millis(0), None)?;
    info!(target = %target.display(), "catalog backed up");
    Ok(())
}

/// Trim the backup set of a database: keep at least the newest
/// [`MIN_BACKUPS_KEPT`], and everything while the running total stays under
/// [`MAX_BACKUP_BYTES`].
pub fn trim_backups(database: &Path) -> Result<()> {
    let Some(directory) = database.parent() else {
        return Ok(());
    };
    if !directory.exists() {
        return Ok(());
    }
    let (stem, _) = stem_and_extension(database);
    let prefix = format!("{stem}{BACKUP_SUFFIX}");

    let mut backups: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        backups.push((entry.path(), metadata.len(), modified));
    }
    // Newest first.
    backups.sort_by(|a, b| b.2.cmp(&a.2));

    let mut total: u64 = 0;
    let mut kept = 0usize;
    let mut removed_bytes: u64 = 0;
    for (path, size, _) in &backups {
        total += size;
        if total > MAX_BACKUP_BYTES && kept >= MIN_BACKUPS_KEPT {
            if let Err(e) = fs::remove_file(path) {
                error!(
                    path = %path.display(),
                    "failed to remove extra backup file, please check permissions: {e}"
                );
            } else {
                removed_bytes += size;
            }
        } else {
            kept += 1;
        }
    }
    if removed_bytes > 0 {
        info!(
            kept,
            freed = removed_bytes,
            "trimmed old catalog backups"
        );
    }
    Ok(())
}
