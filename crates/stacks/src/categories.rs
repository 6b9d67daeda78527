//! The category table and its in-memory cache.
//!
//! Bit indexes are handed out once and never reused; deactivating a category
//! keeps its row. The classic 14 categories are seeded into every fresh
//! catalog.

use librarian::category::{Category, CategoryBitfield, MAX_BIT_INDEX};
use rusqlite::Connection;
use tracing::warn;

use crate::error::Result;

/// The default category set of a fresh catalog.
pub const DEFAULT_CATEGORIES: [(&str, &str); 15] = [
    ("Lead", "#8dd3c7"),
    ("Pad", "#ffffb3"),
    ("Brass", "#4a75b2"),
    ("Organ", "#fb8072"),
    ("Keys", "#80b1d3"),
    ("Bass", "#fdb462"),
    ("Arp", "#b3de69"),
    ("Pluck", "#fccde5"),
    ("Drone", "#d9d9d9"),
    ("Drum", "#bc80bd"),
    ("Bell", "#ccebc5"),
    ("SFX", "#ffed6f"),
    ("Ambient", "#869cab"),
    ("Wind", "#317469"),
    ("Voice", "#a75781"),
];

pub fn insert_default_categories(conn: &Connection) -> Result<()> {
    let mut insert = conn.prepare(
        "INSERT INTO categories (bit_index, name, color, active, sort_order) \
         VALUES (?1, ?2, ?3, 1, ?4)",
    )?;
    for (i, (name, color)) in DEFAULT_CATEGORIES.iter().enumerate() {
        insert.execute((i as i64, name, color, i as i64))?;
    }
    Ok(())
}

/// Load every category row, ordered by bit index.
pub fn load_categories(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(
        "SELECT bit_index, name, color, active, sort_order FROM categories ORDER BY bit_index",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Category {
            bit_index: row.get::<_, i64>(0)? as u8,
            name: row.get(1)?,
            color: row.get(2)?,
            active: row.get::<_, i64>(3)? != 0,
            sort_order: row.get::<_, Option<i64>>(4)?.unwrap_or_default() as i32,
        })
    })?;
    let categories = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(categories)
}

/// The bitfield of the *active* categories, what queries and patch rows use.
pub fn load_bitfield(conn: &Connection) -> Result<CategoryBitfield> {
    let categories = load_categories(conn)?
        .into_iter()
        .filter(|c| c.active)
        .collect();
    Ok(CategoryBitfield::new(categories))
}

/// The next free bit index, or `None` when all 63 are taken.
pub fn next_bit_index(conn: &Connection) -> Result<Option<u8>> {
    let max: Option<i64> = conn.query_row("SELECT MAX(bit_index) FROM categories", [], |row| {
        row.get(0)
    })?;
    let next = max.map(|m| m + 1).unwrap_or(0);
    if next > MAX_BIT_INDEX as i64 {
        warn!(
            "all {} category bit indexes are taken, no new categories can be created in this catalog",
            MAX_BIT_INDEX as i64 + 1
        );
        return Ok(None);
    }
    Ok(Some(next as u8))
}

/// Insert or update category definitions. Bit indexes never change; removal
/// is `active = false`.
pub fn update_categories(conn: &Connection, definitions: &[Category]) -> Result<()> {
    let mut update = conn.prepare(
        "UPDATE categories SET name = :name, color = :color, active = :active, \
         sort_order = :sort_order WHERE bit_index = :bit",
    )?;
    let mut insert = conn.prepare(
        "INSERT INTO categories (bit_index, name, color, active, sort_order) \
         VALUES (:bit, :name, :color, :active, :sort_order)",
    )?;
    for definition in definitions {
        let updated = update.execute(rusqlite::named_params! {
            ":bit": definition.bit_index as i64,
            ":name": definition.name,
            ":color": definition.color,
            ":active": definition.active as i64,
            ":sort_order": definition.sort_order as i64,
        })?;
        if updated == 0 {
            insert.execute(rusqlite::named_params! {
                ":bit": definition.bit_index as i64,
                ":name": definition.name,
                ":color": definition.color,
                ":active": definition.active as i64,
                ":sort_order": definition.sort_order as i64,
            })?;
        }
    }
    Ok(())
}
