//! Patch categories and their bit-field packing.
//!
//! A catalog holds at most 63 categories, each permanently bound to one bit
//! index. A patch row stores its category membership as an i64 bitmask plus a
//! second mask marking the bits the user has explicitly ruled on. Removing a
//! category from the catalog only flips it inactive, the bit is never reused.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Highest usable bit index. Bit 63 is the sign bit of the stored i64 and
/// stays unused.
pub const MAX_BIT_INDEX: u8 = 62;

/// One category definition as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub bit_index: u8,
    pub name: String,
    /// Display color as `#rrggbb`.
    pub color: String,
    pub active: bool,
    pub sort_order: i32,
}

impl Category {
    pub fn new(bit_index: u8, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            bit_index,
            name: name.into(),
            color: color.into(),
            active: true,
            sort_order: bit_index as i32,
        }
    }
}

impl PartialOrd for Category {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Category {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bit_index.cmp(&other.bit_index)
    }
}

/// An unordered set of category bit indexes.
pub type CategorySet = BTreeSet<u8>;

/// The bit assignment of the active categories, recomputed from the category
/// table. Queries take the bitfield as a parameter instead of reaching for
/// global state.
#[derive(Debug, Clone, Default)]
pub struct CategoryBitfield {
    categories: Vec<Category>,
}

impl CategoryBitfield {
    pub fn new(categories: Vec<Category>) -> Self {
        Self { categories }
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn max_bit_index(&self) -> Option<u8> {
        self.categories.iter().map(|c| c.bit_index).max()
    }

    pub fn category_by_name(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn category_by_bit(&self, bit_index: u8) -> Option<&Category> {
        self.categories.iter().find(|c| c.bit_index == bit_index)
    }

    /// Pack a set of bit indexes into the stored i64 mask.
    pub fn set_as_bitfield(&self, set: &CategorySet) -> i64 {
        let mut mask = 0i64;
        for &bit in set {
            if bit <= MAX_BIT_INDEX {
                mask |= 1i64 << bit;
            }
        }
        mask
    }

    /// Unpack a stored mask into the set of bit indexes that are known to
    /// this bitfield. Unknown bits are dropped, they belong to categories
    /// defined elsewhere.
    pub fn set_from_bitfield(&self, mask: i64) -> CategorySet {
        let mut set = CategorySet::new();
        for category in &self.categories {
            if mask & (1i64 << category.bit_index) != 0 {
                set.insert(category.bit_index);
            }
        }
        set
    }
}

/// Pack a raw set of bit indexes without a category table, for callers that
/// already validated the bits.
pub fn raw_set_as_bitfield(set: &CategorySet) -> i64 {
    let mut mask = 0i64;
    for &bit in set {
        if bit <= MAX_BIT_INDEX {
            mask |= 1i64 << bit;
        }
    }
    mask
}

/// Unpack every set bit of a stored mask.
pub fn raw_set_from_bitfield(mask: i64) -> CategorySet {
    (0..=MAX_BIT_INDEX)
        .filter(|bit| mask & (1i64 << bit) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bitfield() -> CategoryBitfield {
        CategoryBitfield::new(vec![
            Category::new(0, "Lead", "#8dd3c7"),
            Category::new(1, "Pad", "#ffffb3"),
            Category::new(11, "SFX", "#ffed6f"),
        ])
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let bitfield = sample_bitfield();
        let set: CategorySet = [0u8, 11].into_iter().collect();
        let mask = bitfield.set_as_bitfield(&set);
        assert_eq!(mask, (1 << 0) | (1 << 11));
        assert_eq!(bitfield.set_from_bitfield(mask), set);
    }

    #[test]
    fn test_unknown_bits_dropped_on_unpack() {
        let bitfield = sample_bitfield();
        let mask = (1 << 1) | (1 << 40);
        let set = bitfield.set_from_bitfield(mask);
        assert_eq!(set, [1u8].into_iter().collect::<CategorySet>());
    }

    #[test]
    fn test_bit_63_never_set() {
        let set: CategorySet = [63u8].into_iter().collect();
        assert_eq!(raw_set_as_bitfield(&set), 0);
    }

    #[test]
    fn test_raw_roundtrip() {
        let set: CategorySet = [2u8, 5, 62].into_iter().collect();
        assert_eq!(raw_set_from_bitfield(raw_set_as_bitfield(&set)), set);
    }

    #[test]
    fn test_lookup_by_name_and_bit() {
        let bitfield = sample_bitfield();
        assert_eq!(bitfield.category_by_name("SFX").map(|c| c.bit_index), Some(11));
        assert_eq!(bitfield.category_by_bit(1).map(|c| c.name.as_str()), Some("Pad"));
        assert!(bitfield.category_by_name("Nope").is_none());
        assert_eq!(bitfield.max_bit_index(), Some(11));
    }
}
