#![warn(missing_docs)]
//! Core library for normalizing archived web-page snapshots: canonical
//! filenames derived from embedded metadata, and inline-asset compaction
//! toward a byte budget.

pub mod canonicalize;
pub mod collision;
pub mod compact;
pub mod controls;
pub mod externalize;
pub mod filename;
mod fullwidth;
pub mod html;
pub mod logging;
pub mod recompress;
pub mod source_url;
pub mod strip;

pub use canonicalize::{
    canonicalize_tree, canonicalize_tree_with, CanonicalizeError, FileOutcome, RunSummary,
};
pub use collision::{rename_no_clobber, resolve_name, DiskNamespace, PlannedNamespace, Resolution};
pub use compact::{
    compact_file, compact_to_budget, run_pass, write_document_atomically, BudgetOutcome,
    BudgetState, CompactError, CompactionPolicy, CompactionSummary, PassReport,
};
pub use controls::{CompactCli, CompactControls, RenameCli, RenameControls};
pub use externalize::{externalize, ExternalizeError, ExternalizedDocument};
pub use filename::{flatten_url, plan_file_name, sanitize_file_name, NamePlan, NoOpReason};
pub use logging::{init_logging, LogFormat};
pub use recompress::{
    GifPolicy, ImageRecompressor, PassParams, RecompressError, RecompressionCache, Recompressor,
};
pub use source_url::{extract_source_url, SignalPriority};
pub use strip::{FilterSet, StripError};
