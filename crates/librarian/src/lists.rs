//! Patch lists and banks.
//!
//! A [`PatchList`] is a free-form ordered list of holders. A [`SynthBank`]
//! is a list shaped like one bank of a device: always exactly `bank_size`
//! slots, positions renumbered on every write, with a dirty set tracking what
//! changed since the last sync with the instrument.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::model::{BankNumber, PatchHolder, ProgramNumber};
use crate::synth::{self, Synth};

/// Discriminates the list flavors in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchListType {
    Normal = 0,
    SynthBank = 1,
    UserBank = 2,
    Import = 3,
}

impl PatchListType {
    pub fn from_stored(value: i64) -> Option<Self> {
        match value {
            0 => Some(PatchListType::Normal),
            1 => Some(PatchListType::SynthBank),
            2 => Some(PatchListType::UserBank),
            3 => Some(PatchListType::Import),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BankError {
    #[error("list contains patches not for synth {expected} (found {found})")]
    ForeignSynth { expected: String, found: String },

    #[error("{given} patches do not fit into a bank of {size}")]
    TooManyPatches { given: usize, size: usize },

    #[error("position {position} is outside the bank of {size}")]
    PositionOutOfRange { position: usize, size: usize },
}

/// Free-form ordered list of patches, identified by a UUID.
#[derive(Debug, Clone)]
pub struct PatchList {
    id: String,
    name: String,
    patches: Vec<PatchHolder>,
}

impl PatchList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            patches: Vec::new(),
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            patches: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn patches(&self) -> &[PatchHolder] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn set_patches(&mut self, patches: Vec<PatchHolder>) {
        self.patches = patches;
    }

    pub fn add_patch(&mut self, patch: PatchHolder) {
        self.patches.push(patch);
    }

    /// Put the patch at index 0, removing every other entry with the same
    /// (synth, fingerprint). Recently-used lists want exactly one entry per
    /// sound.
    pub fn insert_at_top_and_remove_duplicates(&mut self, patch: PatchHolder) {
        self.patches.retain(|existing| !existing.same_patch_as(&patch));
        self.patches.insert(0, patch);
    }
}

/// A list with the shape of one device bank.
#[derive(Clone)]
pub struct SynthBank {
    list: PatchList,
    synth: Arc<dyn Synth>,
    bank: BankNumber,
    dirty_positions: BTreeSet<usize>,
    last_synced: Option<DateTime<Utc>>,
}

impl SynthBank {
    pub fn new(name: impl Into<String>, synth: Arc<dyn Synth>, bank: BankNumber) -> Self {
        Self {
            list: PatchList::new(name),
            synth,
            bank,
            dirty_positions: BTreeSet::new(),
            last_synced: None,
        }
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        synth: Arc<dyn Synth>,
        bank: BankNumber,
    ) -> Self {
        Self {
            list: PatchList::with_id(id, name),
            synth,
            bank,
            dirty_positions: BTreeSet::new(),
            last_synced: None,
        }
    }

    /// The well-known id of the live bank mirror of a synth.
    pub fn active_bank_id(synth_name: &str, bank_index: u32) -> String {
        format!("{synth_name}-bank-{bank_index}")
    }

    /// The live mirror of what is currently in the instrument's bank.
    pub fn active(synth: Arc<dyn Synth>, bank: BankNumber, last_synced: Option<DateTime<Utc>>) -> Self {
        let id = Self::active_bank_id(&synth.name(), bank.index());
        let name = synth::friendly_bank_name(&*synth, bank.index());
        let mut result = Self::with_id(id, name, synth, bank);
        result.last_synced = last_synced;
        result
    }

    pub fn id(&self) -> &str {
        self.list.id()
    }

    pub fn name(&self) -> &str {
        self.list.name()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.list.set_name(name);
    }

    pub fn synth(&self) -> &Arc<dyn Synth> {
        &self.synth
    }

    pub fn bank(&self) -> BankNumber {
        self.bank
    }

    pub fn bank_size(&self) -> usize {
        self.bank.size() as usize
    }

    pub fn patches(&self) -> &[PatchHolder] {
        self.list.patches()
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn set_last_synced(&mut self, when: Option<DateTime<Utc>>) {
        self.last_synced = when;
    }

    pub fn is_writable(&self) -> bool {
        synth::is_bank_writable(&*self.synth, self.bank.index())
    }

    fn validate(&self, patch: &PatchHolder) -> Result<(), BankError> {
        if !patch.synth_name().is_empty() && patch.synth_name() != self.synth.name() {
            return Err(BankError::ForeignSynth {
                expected: self.synth.name(),
                found: patch.synth_name().to_string(),
            });
        }
        Ok(())
    }

    /// Replace the bank content. Positions are renumbered 0.., missing slots
    /// are padded with empty holders so the bank always has exactly
    /// `bank_size` entries. Nothing is modified on a validation error.
    pub fn set_patches(&mut self, mut patches: Vec<PatchHolder>) -> Result<(), BankError> {
        if patches.len() > self.bank_size() {
            return Err(BankError::TooManyPatches {
                given: patches.len(),
                size: self.bank_size(),
            });
        }
        for patch in &patches {
            self.validate(patch)?;
        }
        // The incoming program info reflects where the patch came from, not
        // where it sits in this bank: renumber everything.
        for (position, patch) in patches.iter_mut().enumerate() {
            patch.bank = Some(self.bank);
            patch.program = Some(ProgramNumber::with_bank(self.bank, position as u32));
        }
        for position in patches.len()..self.bank_size() {
            let mut empty = PatchHolder::empty_slot(&self.synth);
            empty.bank = Some(self.bank);
            empty.program = Some(ProgramNumber::with_bank(self.bank, position as u32));
            patches.push(empty);
        }
        self.list.set_patches(patches);
        Ok(())
    }

    /// Put one patch at a position, marking the position dirty when its
    /// content or name actually changed.
    pub fn update_patch_at_position(
        &mut self,
        position: usize,
        patch: PatchHolder,
    ) -> Result<(), BankError> {
        if position >= self.bank_size() {
            return Err(BankError::PositionOutOfRange {
                position,
                size: self.bank_size(),
            });
        }
        self.validate(&patch)?;
        let mut current = self.list.patches().to_vec();
        while current.len() < self.bank_size() {
            current.push(PatchHolder::empty_slot(&self.synth));
        }
        let existing = &current[position];
        if existing.fingerprint() != patch.fingerprint() || existing.name() != patch.name() {
            self.dirty_positions.insert(position);
        }
        current[position] = patch;
        self.set_patches(current)
    }

    /// Copy a donor list into the bank starting at `position`. Donor entries
    /// for other synths are skipped; every written position is marked dirty.
    pub fn copy_list_to_position(
        &mut self,
        position: usize,
        donor: &PatchList,
    ) -> Result<(), BankError> {
        if position >= self.bank_size() {
            return Err(BankError::PositionOutOfRange {
                position,
                size: self.bank_size(),
            });
        }
        let mut current = self.list.patches().to_vec();
        while current.len() < self.bank_size() {
            current.push(PatchHolder::empty_slot(&self.synth));
        }
        let donor_patches = donor.patches();
        let mut read_pos = 0usize;
        let mut write_pos = position;
        let end = self.bank_size().min(position + donor_patches.len());
        while write_pos < end && read_pos < donor_patches.len() {
            let candidate = &donor_patches[read_pos];
            if candidate.synth_name() == self.synth.name() {
                current[write_pos] = candidate.clone();
                self.dirty_positions.insert(write_pos);
                write_pos += 1;
                read_pos += 1;
            } else {
                info!(
                    patch = candidate.name(),
                    synth = candidate.synth_name(),
                    "skipping foreign patch while filling bank"
                );
                read_pos += 1;
            }
        }
        self.set_patches(current)
    }

    /// Fill every empty slot with the given patch, marking filled positions
    /// dirty.
    pub fn fill_with_patch(&mut self, init_patch: PatchHolder) -> Result<(), BankError> {
        self.validate(&init_patch)?;
        let mut current = self.list.patches().to_vec();
        let mut modified = false;
        for (position, slot) in current.iter_mut().enumerate() {
            if !slot.has_patch() {
                *slot = init_patch.clone();
                self.dirty_positions.insert(position);
                modified = true;
            }
        }
        if modified {
            self.set_patches(current)?;
        }
        Ok(())
    }

    pub fn is_position_dirty(&self, position: usize) -> bool {
        self.dirty_positions.contains(&position)
    }

    pub fn dirty_positions(&self) -> &BTreeSet<usize> {
        &self.dirty_positions
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_positions.is_empty()
    }

    /// Forget the dirty set, e.g. after a successful send to the instrument.
    pub fn clear_dirty(&mut self) {
        self.dirty_positions.clear();
    }
}

/// A stored bank not tied to the live instrument state.
pub type UserBank = SynthBank;

/// The per-import membership list created by every merge into the catalog.
#[derive(Debug, Clone)]
pub struct ImportList {
    list: PatchList,
    synth_name: String,
}

impl ImportList {
    pub fn new(synth_name: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            list: PatchList::with_id(id, name),
            synth_name: synth_name.into(),
        }
    }

    pub fn id(&self) -> &str {
        self.list.id()
    }

    pub fn name(&self) -> &str {
        self.list.name()
    }

    pub fn synth_name(&self) -> &str {
        &self.synth_name
    }

    pub fn patches(&self) -> &[PatchHolder] {
        self.list.patches()
    }

    pub fn set_patches(&mut self, patches: Vec<PatchHolder>) {
        self.list.set_patches(patches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Patch;
    use crate::testsynth::{make_holder, TestSynth};

    fn bank_of(synth: &Arc<dyn Synth>, index: u32, size: u32) -> BankNumber {
        let _ = synth;
        BankNumber::new(index, size)
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let synth = TestSynth::builder("ListSynth").build();
        let bank = bank_of(&synth, 0, 8);
        let first = make_holder(&synth, "First", bank, 0, None);
        let second = make_holder(&synth, "Second", bank, 1, None);

        let mut list = PatchList::new("Favorites");
        list.set_patches(vec![first]);
        list.add_patch(second);

        assert_eq!(list.len(), 2);
        assert_eq!(list.patches()[0].name(), "First");
        assert_eq!(list.patches()[1].name(), "Second");
    }

    #[test]
    fn test_insert_at_top_removes_duplicates_per_synth() {
        let synth = TestSynth::builder("DupSynth").build();
        let bank = bank_of(&synth, 0, 8);
        let original = make_holder(&synth, "Original", bank, 0, Some(vec![0x33]));
        let replacement = make_holder(&synth, "Replacement", bank, 0, Some(vec![0x33]));

        let mut list = PatchList::new("Recent");
        list.set_patches(vec![original]);
        list.insert_at_top_and_remove_duplicates(replacement);

        assert_eq!(list.len(), 1);
        assert_eq!(list.patches()[0].name(), "Replacement");

        let other_synth = TestSynth::builder("OtherSynth").build();
        let other_bank = bank_of(&other_synth, 0, 8);
        let foreign = make_holder(&other_synth, "Foreign", other_bank, 0, Some(vec![0x33]));
        list.insert_at_top_and_remove_duplicates(foreign);

        assert_eq!(list.len(), 2);
        assert_eq!(list.patches()[0].name(), "Foreign");
        assert_eq!(list.patches()[1].name(), "Replacement");
    }

    #[test]
    fn test_bank_normalizes_and_pads() {
        let synth = TestSynth::builder("BankSynth").single_bank(3).build();
        let bank = bank_of(&synth, 0, 3);
        let patch_a = make_holder(&synth, "PatchA", bank, 2, None);
        let patch_b = make_holder(&synth, "PatchB", bank, 0, None);

        let mut synth_bank = SynthBank::new("Test Bank", Arc::clone(&synth), bank);
        synth_bank.set_patches(vec![patch_a, patch_b]).unwrap();

        let patches = synth_bank.patches();
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0].name(), "PatchA");
        assert_eq!(
            patches[0].program.map(|p| p.to_zero_based_discarding_bank()),
            Some(0)
        );
        assert_eq!(patches[1].name(), "PatchB");
        assert_eq!(
            patches[1].program.map(|p| p.to_zero_based_discarding_bank()),
            Some(1)
        );
        assert!(!patches[2].has_patch());
        assert_eq!(
            patches[2].program.map(|p| p.to_zero_based_discarding_bank()),
            Some(2)
        );
    }

    #[test]
    fn test_bank_rejects_foreign_synth_without_mutation() {
        let synth = TestSynth::builder("Own").single_bank(4).build();
        let foreign_synth = TestSynth::builder("Foreign").single_bank(4).build();
        let bank = bank_of(&synth, 0, 4);
        let own = make_holder(&synth, "Own", bank, 0, None);
        let foreign = make_holder(&foreign_synth, "Bad", bank_of(&foreign_synth, 0, 4), 0, None);

        let mut synth_bank = SynthBank::new("Bank", Arc::clone(&synth), bank);
        synth_bank.set_patches(vec![own.clone()]).unwrap();
        let before: Vec<String> = synth_bank.patches().iter().map(|p| p.name().to_string()).collect();

        assert!(synth_bank.set_patches(vec![own, foreign]).is_err());
        let after: Vec<String> = synth_bank.patches().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bank_rejects_overfill() {
        let synth = TestSynth::builder("Tiny").single_bank(1).build();
        let bank = bank_of(&synth, 0, 1);
        let a = make_holder(&synth, "A", bank, 0, None);
        let b = make_holder(&synth, "B", bank, 1, None);
        let mut synth_bank = SynthBank::new("Bank", Arc::clone(&synth), bank);
        assert!(matches!(
            synth_bank.set_patches(vec![a, b]),
            Err(BankError::TooManyPatches { given: 2, size: 1 })
        ));
    }

    #[test]
    fn test_copy_list_to_position_skips_foreign_and_marks_dirty() {
        let synth = TestSynth::builder("CopySynth").single_bank(4).build();
        let bank = bank_of(&synth, 0, 4);
        let initial: Vec<PatchHolder> = (0..4)
            .map(|i| make_holder(&synth, &format!("Initial{i}"), bank, i, Some(vec![0x20 + i as u8])))
            .collect();

        let mut synth_bank = SynthBank::new("Bank", Arc::clone(&synth), bank);
        synth_bank.set_patches(initial).unwrap();

        let foreign_synth = TestSynth::builder("Foreign").single_bank(4).build();
        let mut donor = PatchList::new("Donor");
        donor.set_patches(vec![
            make_holder(&synth, "DonorOne", bank, 0, Some(vec![0x60])),
            make_holder(&foreign_synth, "Foreign", bank_of(&foreign_synth, 0, 4), 0, None),
            make_holder(&synth, "DonorTwo", bank, 1, Some(vec![0x61])),
        ]);

        synth_bank.copy_list_to_position(1, &donor).unwrap();

        let patches = synth_bank.patches();
        assert_eq!(patches[1].name(), "DonorOne");
        assert_eq!(patches[2].name(), "DonorTwo");
        assert!(synth_bank.is_position_dirty(1));
        assert!(synth_bank.is_position_dirty(2));
        assert!(!synth_bank.is_position_dirty(0));
        assert!(!synth_bank.is_position_dirty(3));
    }

    #[test]
    fn test_fill_with_patch_fills_only_empty_slots() {
        let synth = TestSynth::builder("FillSynth").single_bank(3).build();
        let bank = bank_of(&synth, 0, 3);
        let only = make_holder(&synth, "Only", bank, 0, Some(vec![0x01]));
        let mut synth_bank = SynthBank::new("Bank", Arc::clone(&synth), bank);
        synth_bank.set_patches(vec![only]).unwrap();

        let mut init = PatchHolder::new(&synth, None, Some(Patch::voice(vec![0x7f])));
        init.set_name("Init");
        synth_bank.fill_with_patch(init).unwrap();

        let patches = synth_bank.patches();
        assert_eq!(patches[0].name(), "Only");
        assert_eq!(patches[1].name(), "Init");
        assert_eq!(patches[2].name(), "Init");
        assert!(synth_bank.is_position_dirty(1));
        assert!(synth_bank.is_position_dirty(2));
        assert!(!synth_bank.is_position_dirty(0));

        synth_bank.clear_dirty();
        assert!(!synth_bank.is_dirty());
    }

    #[test]
    fn test_active_bank_id_scheme() {
        assert_eq!(SynthBank::active_bank_id("Matrix-1000", 2), "Matrix-1000-bank-2");
    }

    #[test]
    fn test_update_patch_at_position_dirty_only_on_change() {
        let synth = TestSynth::builder("UpSynth").single_bank(2).build();
        let bank = bank_of(&synth, 0, 2);
        let a = make_holder(&synth, "A", bank, 0, Some(vec![0x01]));
        let mut synth_bank = SynthBank::new("Bank", Arc::clone(&synth), bank);
        synth_bank.set_patches(vec![a.clone()]).unwrap();
        synth_bank.clear_dirty();

        // Same content, same name: nothing gets dirty.
        synth_bank.update_patch_at_position(0, a).unwrap();
        assert!(!synth_bank.is_dirty());

        let b = make_holder(&synth, "B", bank, 0, Some(vec![0x02]));
        synth_bank.update_patch_at_position(0, b).unwrap();
        assert!(synth_bank.is_position_dirty(0));
    }
}
