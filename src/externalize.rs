//! Moves inline images out of a snapshot into a sibling asset directory.

use crate::filename::split_extension;
use crate::recompress::{
    extension_for_mime, ContentHash, Conversion, PassParams, RecompressionCache, Recompressor,
};
use datauri_scan::splice;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const HASH_PREFIX_LEN: usize = 16;

/// A document whose images now live in files next to it.
#[derive(Debug, Clone)]
pub struct ExternalizedDocument {
    /// The rewritten document, not yet written.
    pub document: Vec<u8>,
    /// Asset files written, in order of first reference.
    pub assets: Vec<PathBuf>,
    /// Conversions computed.
    pub encodes: usize,
    /// Conversions served from the cache.
    pub cache_hits: usize,
}

struct PendingAsset {
    file_name: String,
    bytes: Vec<u8>,
}

/// Name of the asset directory for a document: `<stem>_files`, restricted to
/// characters that need no escaping in a relative URL.
pub fn asset_dir_name(document_path: &Path) -> String {
    let file_name = document_path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    let (stem, _) = split_extension(&file_name);
    let safe: String = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}_files")
}

/// Writes each distinct image once to `<dir>/<stem>_files/NNNN-<hash>.<ext>`
/// and points every reference at it.
///
/// Images that recompress are written in their smaller form; SVGs and images
/// that do not shrink are written as they are. Payloads that cannot be
/// decoded stay inline. Assets are on disk before this returns; writing the
/// document itself is left to the caller.
pub fn externalize(
    document: &[u8],
    document_path: &Path,
    params: &PassParams,
    recompressor: &impl Recompressor,
) -> Result<ExternalizedDocument, ExternalizeError> {
    let dir_name = asset_dir_name(document_path);
    let mut cache = RecompressionCache::new();
    let mut assigned: HashMap<ContentHash, String> = HashMap::new();
    let mut pending: Vec<PendingAsset> = Vec::new();

    let (rewritten, replaced) = splice(document, |resource| {
        let decoded = match resource.decode() {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(offset = resource.marker_start(), error = %err, "keeping undecodable payload inline");
                return None;
            }
        };
        let hash = ContentHash::of(&decoded);
        if let Some(reference) = assigned.get(&hash) {
            return Some(reference.clone().into_bytes());
        }
        let (extension, bytes) = match cache.resolve(hash, params, || {
            recompressor.recompress(resource.mime(), &decoded, params)
        }) {
            Conversion::Replaced(recompressed) => {
                (extension_for_mime(&recompressed.mime), recompressed.bytes.clone())
            }
            Conversion::PassThrough => (extension_for_mime(resource.mime()), decoded),
            Conversion::Failed => return None,
        };
        let file_name = format!(
            "{:04}-{}.{extension}",
            pending.len() + 1,
            hash.short_hex(HASH_PREFIX_LEN)
        );
        let reference = format!("{dir_name}/{file_name}");
        pending.push(PendingAsset { file_name, bytes });
        assigned.insert(hash, reference.clone());
        Some(reference.into_bytes())
    });

    let mut assets = Vec::with_capacity(pending.len());
    if !pending.is_empty() {
        let asset_dir = document_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&dir_name);
        fs::create_dir_all(&asset_dir).map_err(|source| ExternalizeError::CreateDir {
            path: asset_dir.clone(),
            source,
        })?;
        for asset in pending {
            let path = asset_dir.join(&asset.file_name);
            fs::write(&path, &asset.bytes).map_err(|source| ExternalizeError::WriteAsset {
                path: path.clone(),
                source,
            })?;
            assets.push(path);
        }
    }

    info!(
        document = %document_path.display(),
        references = replaced,
        assets = assets.len(),
        "externalized images"
    );
    Ok(ExternalizedDocument {
        document: rewritten,
        assets,
        encodes: cache.encodes(),
        cache_hits: cache.hits(),
    })
}

/// Failure writing extracted assets.
#[derive(Debug)]
pub enum ExternalizeError {
    /// The asset directory could not be created.
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// An asset file could not be written.
    WriteAsset {
        /// Asset path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl fmt::Display for ExternalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir { path, source } => {
                write!(f, "failed to create asset directory {}: {source}", path.display())
            }
            Self::WriteAsset { path, source } => {
                write!(f, "failed to write asset {}: {source}", path.display())
            }
        }
    }
}

impl Error for ExternalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDir { source, .. } | Self::WriteAsset { source, .. } => Some(source),
        }
    }
}
