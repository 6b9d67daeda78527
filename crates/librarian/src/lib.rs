//! Librarian: the patch model and the engines that move patches between
//! synthesizers, files and the catalog.
//!
//! - **Model**: opaque [`model::Patch`] blobs, [`model::PatchHolder`] with
//!   favorites, categories, provenance; MD5 [`fingerprint::Fingerprint`]
//!   identity.
//! - **Capability records**: synth adapters plug protocol pieces into a
//!   [`synth::SynthCapabilities`] record; every engine here consumes only
//!   those traits.
//! - **Parser**: sliding-window assembly of patches out of raw sysex
//!   sequences.
//! - **Download / send**: the six bank acquisition strategies and their
//!   inverse.
//! - **Lists & banks**: ordered lists, fixed-size synth banks with dirty
//!   tracking, import lists.
//! - **Export / interchange**: `.syx`, zip, SMF files and the JSON
//!   PatchInterchangeFormat.

pub mod category;
pub mod download;
pub mod export;
pub mod fingerprint;
pub mod interchange;
pub mod listfill;
pub mod lists;
pub mod model;
pub mod parser;
pub mod send;
pub mod source;
pub mod synth;
pub mod sysex;
pub mod testsynth;

pub use category::{Category, CategoryBitfield, CategorySet, MAX_BIT_INDEX};
pub use download::{
    determine_download_method, download_bank, download_banks, download_edit_buffer,
    DownloadError, DownloadOptions, ProgressCallback,
};
pub use export::{export_patches, ExportError, ExportFormat, ExportParameters, FileMode};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use interchange::{load_interchange, save_interchange, InterchangeError};
pub use listfill::{fill_patch_list, ListFillMode, ListFillRequest, ListFillResult};
pub use lists::{BankError, ImportList, PatchList, PatchListType, SynthBank, UserBank};
pub use model::{BankNumber, Favorite, Patch, PatchHolder, ProgramNumber, DATA_TYPE_PATCH};
pub use parser::{assemble_patches, assemble_patches_with_config, ParserConfig};
pub use send::{send_bank_to_synth, SendError, SendProgress};
pub use source::{SourceInfo, EDIT_BUFFER_IMPORT_ID};
pub use synth::{
    bank_size, bank_start_index, friendly_bank_name, is_bank_writable, number_of_banks,
    BankDescriptor, BankDownloadMethod, BankDumpCapability, BankSendCapability,
    DataFileLoadCapability, DefaultNameCapability, EditBufferCapability,
    HandshakeLoadingCapability, HandshakeState, HasBanksCapability, MessageClassification,
    ProgramDumpCapability, StoredPatchNameCapability, StreamLoadCapability, StreamType, Synth,
    SynthCapabilities, SynthRegistry,
};
