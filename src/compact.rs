//! Shrinks a snapshot's inline images until it fits a byte budget.
//!
//! Each pass rescans the whole document, so offsets are always derived from
//! the bytes the previous pass produced. Between passes the encoder settings
//! are tightened: quality first, then the width cap.

use crate::controls::CompactControls;
use crate::externalize::{externalize, ExternalizeError};
use crate::recompress::{
    ContentHash, Conversion, ImageRecompressor, PassParams, RecompressionCache, Recompressor,
};
use crate::strip::FilterOutcome;
use datauri_scan::{data_uri, splice};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Quality removed between passes.
pub const QUALITY_STEP: u8 = 10;
/// Lowest quality the loop will try.
pub const QUALITY_FLOOR: u8 = 30;
/// Width cap removed between passes once quality is at its floor.
pub const WIDTH_STEP: u32 = 200;
/// Narrowest width cap the loop will try.
pub const WIDTH_FLOOR: u32 = 400;

/// Result of one scan-and-replace pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Settings used for the pass.
    pub params: PassParams,
    /// Resources replaced.
    pub replacements: usize,
    /// Document size before the pass.
    pub bytes_before: usize,
    /// Document size after the pass.
    pub bytes_after: usize,
}

/// Runs one pass over `document`.
///
/// A resource is replaced only when its new URI is shorter than the old one,
/// so the output is never larger than the input.
pub fn run_pass(
    document: &[u8],
    params: &PassParams,
    recompressor: &impl Recompressor,
    cache: &mut RecompressionCache,
) -> (Vec<u8>, PassReport) {
    let (output, replacements) = splice(document, |resource| {
        let decoded = match resource.decode() {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(offset = resource.marker_start(), error = %err, "payload is not valid base64");
                return None;
            }
        };
        let conversion = cache.resolve(ContentHash::of(&decoded), params, || {
            recompressor.recompress(resource.mime(), &decoded, params)
        });
        let Conversion::Replaced(recompressed) = conversion else {
            return None;
        };
        let uri = data_uri(&recompressed.mime, &recompressed.bytes);
        (uri.len() < resource.uri_range().len()).then_some(uri)
    });
    let report = PassReport {
        params: *params,
        replacements,
        bytes_before: document.len(),
        bytes_after: output.len(),
    };
    (output, report)
}

/// Settings for [`compact_to_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Settings for the first pass.
    pub initial: PassParams,
    /// Size the document should reach.
    pub target_bytes: usize,
    /// Optional cap on the number of passes.
    pub max_passes: Option<usize>,
}

/// Why the budget loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    /// The document is at or under the target.
    Converged,
    /// A pass replaced nothing or saved nothing.
    Stalled,
    /// Quality and width are both at their floors.
    ExhaustedParameters,
    /// The caller's pass cap was reached.
    PassLimit,
}

impl fmt::Display for BudgetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Converged => "converged",
            Self::Stalled => "stalled",
            Self::ExhaustedParameters => "exhausted parameters",
            Self::PassLimit => "pass limit",
        })
    }
}

/// Final state of a budget run.
#[derive(Debug, Clone)]
pub struct BudgetOutcome {
    /// Terminal state.
    pub state: BudgetState,
    /// The compacted document.
    pub document: Vec<u8>,
    /// One report per pass, in order.
    pub passes: Vec<PassReport>,
    /// Conversions actually computed.
    pub encodes: usize,
    /// Conversions served from the cache.
    pub cache_hits: usize,
}

/// Next, tighter settings, or `None` when both knobs are at their floors.
pub fn tighten(params: &PassParams) -> Option<PassParams> {
    if params.quality > QUALITY_FLOOR {
        return Some(PassParams {
            quality: params.quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR),
            ..*params
        });
    }
    if params.max_width > WIDTH_FLOOR {
        return Some(PassParams {
            max_width: params.max_width.saturating_sub(WIDTH_STEP).max(WIDTH_FLOOR),
            ..*params
        });
    }
    None
}

/// Runs passes until the document fits, stops shrinking, or runs out of
/// settings to try. Always runs at least one pass.
pub fn compact_to_budget(document: &[u8], policy: &CompactionPolicy) -> BudgetOutcome {
    compact_to_budget_with(document, policy, &ImageRecompressor)
}

/// [`compact_to_budget`] with a caller-chosen recompressor.
pub fn compact_to_budget_with(
    document: &[u8],
    policy: &CompactionPolicy,
    recompressor: &impl Recompressor,
) -> BudgetOutcome {
    let mut cache = RecompressionCache::new();
    let mut current = document.to_vec();
    let mut params = policy.initial;
    let mut passes = Vec::new();

    let state = loop {
        if !passes.is_empty() && policy.max_passes.is_some_and(|cap| passes.len() >= cap) {
            break BudgetState::PassLimit;
        }
        let (next, report) = run_pass(&current, &params, recompressor, &mut cache);
        info!(
            pass = passes.len() + 1,
            quality = params.quality,
            max_width = params.max_width,
            replacements = report.replacements,
            before = report.bytes_before,
            after = report.bytes_after,
            "compaction pass"
        );
        passes.push(report);
        let shrank = report.bytes_after < report.bytes_before;
        if shrank {
            current = next;
        }
        if current.len() <= policy.target_bytes {
            break BudgetState::Converged;
        }
        if report.replacements == 0 || !shrank {
            break BudgetState::Stalled;
        }
        match tighten(&params) {
            Some(tighter) => params = tighter,
            None => break BudgetState::ExhaustedParameters,
        }
    };

    BudgetOutcome {
        state,
        document: current,
        passes,
        encodes: cache.encodes(),
        cache_hits: cache.hits(),
    }
}

/// Replaces `path` with `bytes` through a temporary file in the same
/// directory, so readers see either the old or the new document.
pub fn write_document_atomically(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let wrap = |source: io::Error| WriteError {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir).map_err(wrap)?;
    temp.write_all(bytes).map_err(wrap)?;
    temp.as_file().sync_all().map_err(wrap)?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions()).map_err(wrap)?;
    }
    temp.persist(path).map_err(|err| wrap(err.error))?;
    Ok(())
}

/// What [`compact_file`] did.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionSummary {
    /// Size of the file as read.
    pub original_bytes: usize,
    /// Size of the file as written.
    pub final_bytes: usize,
    /// Bytes removed by each stripping filter that ran.
    pub filters: Vec<FilterOutcome>,
    /// Budget loop end state, when images were compacted inline.
    pub budget_state: Option<BudgetState>,
    /// Budget loop passes, in order.
    pub passes: Vec<PassReport>,
    /// Asset files written, when images were extracted.
    pub assets_written: usize,
    /// Conversions computed.
    pub encodes: usize,
    /// Conversions served from the cache.
    pub cache_hits: usize,
}

/// Compacts the snapshot at `path` in place: stripping filters first, then
/// either inline recompression to the budget or extraction to an asset
/// directory. The file is only rewritten when its bytes changed.
pub fn compact_file(path: &Path, controls: &CompactControls) -> Result<CompactionSummary, CompactError> {
    let original = fs::read(path).map_err(|source| CompactError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let (stripped, filters) = controls.filters().apply(&original);

    let mut summary = CompactionSummary {
        original_bytes: original.len(),
        final_bytes: original.len(),
        filters,
        budget_state: None,
        passes: Vec::new(),
        assets_written: 0,
        encodes: 0,
        cache_hits: 0,
    };

    let compacted = if controls.extract_images() {
        let extracted = externalize(&stripped, path, &controls.initial_params(), &ImageRecompressor)
            .map_err(CompactError::Externalize)?;
        summary.assets_written = extracted.assets.len();
        summary.encodes = extracted.encodes;
        summary.cache_hits = extracted.cache_hits;
        extracted.document
    } else {
        let policy = controls.policy_for(original.len());
        let outcome = compact_to_budget(&stripped, &policy);
        summary.encodes = outcome.encodes;
        summary.cache_hits = outcome.cache_hits;
        summary.budget_state = Some(outcome.state);
        summary.passes = outcome.passes;
        outcome.document
    };

    if compacted != original {
        write_document_atomically(path, &compacted).map_err(CompactError::Write)?;
    }
    summary.final_bytes = compacted.len();
    info!(
        path = %path.display(),
        before = summary.original_bytes,
        after = summary.final_bytes,
        "compaction finished"
    );
    Ok(summary)
}

/// Failure replacing a document on disk.
#[derive(Debug)]
pub struct WriteError {
    /// Document being written.
    pub path: PathBuf,
    /// Underlying error.
    pub source: io::Error,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to write {}: {}", self.path.display(), self.source)
    }
}

impl Error for WriteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Errors from [`compact_file`].
#[derive(Debug)]
pub enum CompactError {
    /// The document could not be read.
    Read {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The document could not be written back.
    Write(WriteError),
    /// Extracted assets could not be written.
    Externalize(ExternalizeError),
}

impl fmt::Display for CompactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            Self::Write(err) => write!(f, "{err}"),
            Self::Externalize(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CompactError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Write(err) => Some(err),
            Self::Externalize(err) => Some(err),
        }
    }
}
