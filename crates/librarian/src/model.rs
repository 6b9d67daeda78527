//! The patch and holder model.
//!
//! A [`Patch`] is an opaque byte blob tagged with a data type; the owning
//! synth adapter is the only party that interprets it. A [`PatchHolder`] is
//! the unit the catalog stores: the patch plus everything the librarian knows
//! about it.

use std::sync::{Arc, Weak};

use crate::category::CategorySet;
use crate::fingerprint::Fingerprint;
use crate::source::SourceInfo;
use crate::synth::Synth;

/// Data type id of plain voice patches. Other ids (tunings, waveforms, …)
/// are defined by the adapters.
pub const DATA_TYPE_PATCH: i32 = 0;

/// An opaque device-specific data blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    data_type_id: i32,
    data: Vec<u8>,
}

impl Patch {
    pub fn new(data_type_id: i32, data: Vec<u8>) -> Self {
        Self { data_type_id, data }
    }

    pub fn voice(data: Vec<u8>) -> Self {
        Self::new(DATA_TYPE_PATCH, data)
    }

    pub fn data_type_id(&self) -> i32 {
        self.data_type_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Tri-state favorite flag. `Unknown` survives merges without overwriting a
/// stored decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Favorite {
    #[default]
    Unknown,
    No,
    Yes,
}

impl Favorite {
    pub fn from_stored(value: i64) -> Self {
        match value {
            0 => Favorite::No,
            1 => Favorite::Yes,
            _ => Favorite::Unknown,
        }
    }

    pub fn to_stored(self) -> i64 {
        match self {
            Favorite::Unknown => -1,
            Favorite::No => 0,
            Favorite::Yes => 1,
        }
    }

    pub fn is_favorite(self) -> bool {
        self == Favorite::Yes
    }
}

/// A zero-based bank slot with its size, taken from the bank descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankNumber {
    index: u32,
    size: u32,
}

impl BankNumber {
    pub fn new(index: u32, size: u32) -> Self {
        Self { index, size }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

/// A program place, with or without a bank tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramNumber {
    bank: Option<BankNumber>,
    program: u32,
}

impl ProgramNumber {
    /// A program number counted from the start of memory, bank unknown.
    pub fn from_zero_based(program: u32) -> Self {
        Self {
            bank: None,
            program,
        }
    }

    /// A program number relative to a known bank.
    pub fn with_bank(bank: BankNumber, program: u32) -> Self {
        Self {
            bank: Some(bank),
            program,
        }
    }

    pub fn bank(&self) -> Option<BankNumber> {
        self.bank
    }

    pub fn is_bank_known(&self) -> bool {
        self.bank.is_some()
    }

    /// The program index within its bank (or from memory start when no bank
    /// is known).
    pub fn program_in_bank(&self) -> u32 {
        self.program
    }

    /// Absolute index assuming uniformly sized banks. Adapters with ragged
    /// bank layouts compute their own offsets via the bank descriptors.
    pub fn to_zero_based_with_bank(&self) -> u32 {
        match self.bank {
            Some(bank) => bank.index() * bank.size() + self.program,
            None => self.program,
        }
    }

    pub fn to_zero_based_discarding_bank(&self) -> u32 {
        self.program
    }
}

/// What the catalog stores per patch: the blob, identity, and user metadata.
#[derive(Clone)]
pub struct PatchHolder {
    synth_name: String,
    synth: Weak<dyn Synth>,
    patch: Option<Patch>,
    name: String,
    fingerprint: Option<Fingerprint>,
    pub favorite: Favorite,
    pub hidden: bool,
    /// User-marked "part of my working set".
    pub regular: bool,
    pub bank: Option<BankNumber>,
    pub program: Option<ProgramNumber>,
    categories: CategorySet,
    user_decisions: CategorySet,
    pub comment: String,
    pub author: String,
    pub info: String,
    source: Option<SourceInfo>,
    /// Import list id assigned by the catalog, empty until first stored.
    pub source_id: String,
}

impl PatchHolder {
    pub fn new(synth: &Arc<dyn Synth>, source: Option<SourceInfo>, patch: Option<Patch>) -> Self {
        let fingerprint = patch.as_ref().map(|p| synth.fingerprint(p));
        let name = patch
            .as_ref()
            .and_then(|p| {
                synth
                    .capabilities()
                    .stored_name
                    .as_ref()
                    .and_then(|sn| sn.name_of(p))
            })
            .unwrap_or_default();
        Self {
            synth_name: synth.name(),
            synth: Arc::downgrade(synth),
            patch,
            name,
            fingerprint,
            source,
            ..Self::default()
        }
    }

    /// An empty slot in a bank: no patch, no fingerprint.
    pub fn empty_slot(synth: &Arc<dyn Synth>) -> Self {
        Self::new(synth, None, None)
    }

    pub fn synth_name(&self) -> &str {
        &self.synth_name
    }

    /// The adapter, while the registry still holds it.
    pub fn synth(&self) -> Option<Arc<dyn Synth>> {
        self.synth.upgrade()
    }

    pub fn patch(&self) -> Option<&Patch> {
        self.patch.as_ref()
    }

    pub fn has_patch(&self) -> bool {
        self.patch.is_some()
    }

    pub fn data_type_id(&self) -> i32 {
        self.patch.as_ref().map(|p| p.data_type_id()).unwrap_or(0)
    }

    /// Replace the patch bytes, recomputing the fingerprint.
    pub fn set_patch(&mut self, patch: Patch) {
        self.fingerprint = self.synth.upgrade().map(|s| s.fingerprint(&patch));
        self.patch = Some(patch);
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the display name. If the synth stores names inside the patch the
    /// bytes are rewritten and the (possibly clamped) result becomes the
    /// name; voice-relevant filtering keeps the fingerprint stable for those
    /// devices.
    pub fn set_name(&mut self, new_name: &str) {
        if let (Some(synth), Some(patch)) = (self.synth.upgrade(), self.patch.as_ref()) {
            if let Some(stored_name) = synth.capabilities().stored_name.as_ref() {
                if let Some(renamed) = stored_name.rename(patch, new_name) {
                    self.name = stored_name
                        .name_of(&renamed)
                        .unwrap_or_else(|| new_name.to_string());
                    self.fingerprint = Some(synth.fingerprint(&renamed));
                    self.patch = Some(renamed);
                    return;
                }
            }
        }
        self.name = new_name.to_string();
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    pub fn set_categories(&mut self, categories: CategorySet) {
        self.categories = categories;
    }

    pub fn has_category(&self, bit_index: u8) -> bool {
        self.categories.contains(&bit_index)
    }

    pub fn set_category(&mut self, bit_index: u8, has_it: bool) {
        if has_it {
            self.categories.insert(bit_index);
        } else {
            self.categories.remove(&bit_index);
        }
    }

    pub fn user_decisions(&self) -> &CategorySet {
        &self.user_decisions
    }

    pub fn set_user_decisions(&mut self, decisions: CategorySet) {
        self.user_decisions = decisions;
    }

    /// Record that the user has explicitly ruled on this category bit
    /// (whether set or unset).
    pub fn set_user_decision(&mut self, bit_index: u8) {
        self.user_decisions.insert(bit_index);
    }

    pub fn source(&self) -> Option<&SourceInfo> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, source: SourceInfo) {
        self.source = Some(source);
    }

    /// Key for duplicate detection: same synth, same fingerprint.
    pub fn same_patch_as(&self, other: &PatchHolder) -> bool {
        self.synth_name == other.synth_name
            && self.fingerprint.is_some()
            && self.fingerprint == other.fingerprint
    }

    /// Whether the adapter considers this name a factory placeholder.
    pub fn has_default_name(&self) -> bool {
        self.synth()
            .and_then(|synth| {
                synth
                    .capabilities()
                    .default_name
                    .as_ref()
                    .map(|dn| dn.is_default_name(&self.name))
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for PatchHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchHolder")
            .field("synth", &self.synth_name)
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("favorite", &self.favorite)
            .field("hidden", &self.hidden)
            .field("bank", &self.bank)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

// A dangling weak for holders whose synth is not configured (yet).
struct NoSynth;

impl Synth for NoSynth {
    fn name(&self) -> String {
        String::new()
    }

    fn is_own_sysex(&self, _message: &switchboard::MidiMessage) -> bool {
        false
    }

    fn capabilities(&self) -> &crate::synth::SynthCapabilities {
        static NONE: std::sync::OnceLock<crate::synth::SynthCapabilities> =
            std::sync::OnceLock::new();
        NONE.get_or_init(crate::synth::SynthCapabilities::default)
    }
}

impl Default for PatchHolder {
    fn default() -> Self {
        let unbound: Weak<NoSynth> = Weak::new();
        Self {
            synth_name: String::new(),
            synth: unbound,
            patch: None,
            name: String::new(),
            fingerprint: None,
            favorite: Favorite::Unknown,
            hidden: false,
            regular: false,
            bank: None,
            program: None,
            categories: CategorySet::new(),
            user_decisions: CategorySet::new(),
            comment: String::new(),
            author: String::new(),
            info: String::new(),
            source: None,
            source_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsynth::TestSynth;

    #[test]
    fn test_holder_computes_fingerprint_from_synth_filter() {
        let synth = TestSynth::builder("FpSynth").build();
        let holder = PatchHolder::new(
            &synth,
            None,
            Some(Patch::voice(vec![0xf0, 0x7d, 0x01, 0xf7])),
        );
        let expected = Fingerprint::from_data(&[0xf0, 0x7d, 0x01, 0xf7]);
        assert_eq!(holder.fingerprint(), Some(&expected));
    }

    #[test]
    fn test_equal_filtered_bytes_equal_fingerprints() {
        let synth = TestSynth::builder("FpSynth").build();
        let a = PatchHolder::new(&synth, None, Some(Patch::voice(vec![1, 2, 3])));
        let b = PatchHolder::new(&synth, None, Some(Patch::voice(vec![1, 2, 3])));
        assert!(a.same_patch_as(&b));
    }

    #[test]
    fn test_empty_slot_has_no_fingerprint() {
        let synth = TestSynth::builder("FpSynth").build();
        let holder = PatchHolder::empty_slot(&synth);
        assert!(holder.fingerprint().is_none());
        assert!(!holder.has_patch());
        let other = PatchHolder::empty_slot(&synth);
        // Two empty slots are never "the same patch".
        assert!(!holder.same_patch_as(&other));
    }

    #[test]
    fn test_program_number_arithmetic() {
        let bank = BankNumber::new(2, 32);
        let program = ProgramNumber::with_bank(bank, 5);
        assert_eq!(program.to_zero_based_with_bank(), 69);
        assert_eq!(program.to_zero_based_discarding_bank(), 5);
        assert!(program.is_bank_known());

        let loose = ProgramNumber::from_zero_based(7);
        assert_eq!(loose.to_zero_based_with_bank(), 7);
        assert!(!loose.is_bank_known());
    }

    #[test]
    fn test_favorite_stored_roundtrip() {
        assert_eq!(Favorite::from_stored(-1), Favorite::Unknown);
        assert_eq!(Favorite::from_stored(0), Favorite::No);
        assert_eq!(Favorite::from_stored(1), Favorite::Yes);
        for favorite in [Favorite::Unknown, Favorite::No, Favorite::Yes] {
            assert_eq!(Favorite::from_stored(favorite.to_stored()), favorite);
        }
    }

    #[test]
    fn test_category_user_decisions_are_independent() {
        let synth = TestSynth::builder("CatSynth").build();
        let mut holder = PatchHolder::new(&synth, None, Some(Patch::voice(vec![1])));
        holder.set_category(1, true);
        holder.set_user_decision(1);
        holder.set_user_decision(11);
        assert!(holder.has_category(1));
        assert!(!holder.has_category(11));
        assert!(holder.user_decisions().contains(&11));
    }

    #[test]
    fn test_set_name_without_stored_name_capability() {
        let synth = TestSynth::builder("NameSynth").build();
        let mut holder = PatchHolder::new(&synth, None, Some(Patch::voice(vec![1])));
        let fp_before = holder.fingerprint().cloned();
        holder.set_name("Bright Pad");
        assert_eq!(holder.name(), "Bright Pad");
        assert_eq!(holder.fingerprint().cloned(), fp_before);
    }
}
