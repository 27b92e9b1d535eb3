//! Renames a tree of snapshots to their canonical names.
//!
//! Documents are inspected concurrently on the blocking pool; renames are
//! then applied one at a time in walk order so collision handling sees every
//! earlier decision.

use crate::collision::{rename_no_clobber, resolve_name, CollisionError, PlannedNamespace, Resolution};
use crate::controls::RenameControls;
use crate::filename::{is_snapshot_name, plan_file_name, NamePlan, NoOpReason};
use crate::html::HtmlScanError;
use crate::source_url::{extract_source_url, SignalPriority};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The file was moved.
    Renamed {
        /// Original path.
        from: PathBuf,
        /// New path.
        to: PathBuf,
    },
    /// Dry run: the file would be moved.
    WouldRename {
        /// Current path.
        from: PathBuf,
        /// Path an apply run would use.
        to: PathBuf,
    },
    /// The file keeps its name.
    Unchanged {
        /// Path of the file.
        path: PathBuf,
        /// Why nothing changed.
        reason: NoOpReason,
    },
    /// The file could not be processed; the batch carried on.
    Failed {
        /// Path of the file.
        path: PathBuf,
        /// Rendered error.
        error: String,
    },
}

/// Counts of outcomes over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Snapshot files found by the walk.
    pub scanned: usize,
    /// Files moved.
    pub renamed: usize,
    /// Files a dry run would move.
    pub would_rename: usize,
    /// Files left alone.
    pub unchanged: usize,
    /// Files that failed.
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &FileOutcome) {
        self.scanned += 1;
        match outcome {
            FileOutcome::Renamed { .. } => self.renamed += 1,
            FileOutcome::WouldRename { .. } => self.would_rename += 1,
            FileOutcome::Unchanged { .. } => self.unchanged += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Canonicalizes every snapshot under `root` using the current time for
/// names that carry no timestamp.
pub async fn canonicalize_tree(
    root: &Path,
    controls: &RenameControls,
) -> Result<RunSummary, CanonicalizeError> {
    canonicalize_tree_with(root, controls, Utc::now(), |_| {}).await
}

/// Canonicalizes every snapshot under `root`, handing each outcome to
/// `report` as soon as it is settled.
pub async fn canonicalize_tree_with(
    root: &Path,
    controls: &RenameControls,
    now: DateTime<Utc>,
    mut report: impl FnMut(&FileOutcome),
) -> Result<RunSummary, CanonicalizeError> {
    if !root.is_dir() {
        return Err(CanonicalizeError::NotADirectory(root.to_path_buf()));
    }

    let files = snapshot_files(root)?;
    info!(root = %root.display(), files = files.len(), apply = controls.apply(), "canonicalizing snapshots");

    let priority = controls.priority();
    let mut inspections = stream::iter(files.into_iter().map(|path| {
        let task_path = path.clone();
        let handle = tokio::task::spawn_blocking(move || inspect_file(&task_path, priority, now));
        async move {
            let plan = match handle.await {
                Ok(plan) => plan,
                Err(err) => Err(FileError::Task(err.to_string())),
            };
            (path, plan)
        }
    }))
    .buffered(controls.jobs());

    let mut planned = PlannedNamespace::new();
    let mut summary = RunSummary::default();
    while let Some((path, plan)) = inspections.next().await {
        let outcome = match plan.and_then(|plan| settle(&path, plan, controls.apply(), &mut planned)) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping snapshot");
                FileOutcome::Failed {
                    path,
                    error: err.to_string(),
                }
            }
        };
        summary.record(&outcome);
        report(&outcome);
    }

    info!(
        scanned = summary.scanned,
        renamed = summary.renamed,
        would_rename = summary.would_rename,
        failed = summary.failed,
        "canonicalization finished"
    );
    Ok(summary)
}

/// Snapshot files under `root`, sorted by name within each directory.
pub fn snapshot_files(root: &Path) -> Result<Vec<PathBuf>, CanonicalizeError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(CanonicalizeError::Walk(err)),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) if is_snapshot_name(name) => files.push(entry.into_path()),
            Some(_) => {}
            None => debug!(path = %entry.path().display(), "skipping non-UTF-8 file name"),
        }
    }
    Ok(files)
}

/// Reads one snapshot and plans its name.
pub fn inspect_file(
    path: &Path,
    priority: SignalPriority,
    now: DateTime<Utc>,
) -> Result<NamePlan, FileError> {
    let current = file_name(path)?;
    let document = fs::read(path).map_err(FileError::Read)?;
    let source_url = extract_source_url(&document, priority).map_err(FileError::Scan)?;
    match &source_url {
        Some(url) => debug!(file = current, url = %url, "source url found"),
        None => debug!(file = current, "no source url"),
    }
    Ok(plan_file_name(current, source_url.as_ref(), now))
}

fn settle(
    path: &Path,
    plan: NamePlan,
    apply: bool,
    planned: &mut PlannedNamespace,
) -> Result<FileOutcome, FileError> {
    let desired = match plan {
        NamePlan::Keep(reason) => {
            return Ok(FileOutcome::Unchanged {
                path: path.to_path_buf(),
                reason,
            })
        }
        NamePlan::Rename { desired } => desired,
    };
    let current = file_name(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let resolution = if apply {
        rename_no_clobber(dir, current, &desired).map_err(FileError::Rename)?
    } else {
        let resolution = resolve_name(dir, current, &desired, &*planned).map_err(FileError::Rename)?;
        if let Resolution::Available(target) = &resolution {
            planned.record_rename(dir, current, target);
        }
        resolution
    };

    Ok(match resolution {
        Resolution::Unchanged => FileOutcome::Unchanged {
            path: path.to_path_buf(),
            reason: NoOpReason::AlreadyCanonical,
        },
        Resolution::Available(target) if apply => {
            info!(from = current, to = %target, "renamed");
            FileOutcome::Renamed {
                from: path.to_path_buf(),
                to: dir.join(target),
            }
        }
        Resolution::Available(target) => FileOutcome::WouldRename {
            from: path.to_path_buf(),
            to: dir.join(target),
        },
    })
}

fn file_name(path: &Path) -> Result<&str, FileError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| FileError::Name(path.to_path_buf()))
}

/// Failure processing a single file.
#[derive(Debug)]
pub enum FileError {
    /// The path has no UTF-8 file name.
    Name(PathBuf),
    /// The document could not be read.
    Read(io::Error),
    /// The document could not be scanned for metadata.
    Scan(HtmlScanError),
    /// The rename could not be performed.
    Rename(CollisionError),
    /// The inspection task panicked or was cancelled.
    Task(String),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(path) => write!(f, "unsupported file name {}", path.display()),
            Self::Read(err) => write!(f, "read failed: {err}"),
            Self::Scan(err) => write!(f, "{err}"),
            Self::Rename(err) => write!(f, "{err}"),
            Self::Task(err) => write!(f, "inspection task failed: {err}"),
        }
    }
}

impl Error for FileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read(err) => Some(err),
            Self::Scan(err) => Some(err),
            Self::Rename(err) => Some(err),
            Self::Name(_) | Self::Task(_) => None,
        }
    }
}

/// Failures that stop a run before any file is touched.
#[derive(Debug)]
pub enum CanonicalizeError {
    /// The root is missing or not a directory.
    NotADirectory(PathBuf),
    /// The root itself could not be walked.
    Walk(walkdir::Error),
}

impl fmt::Display for CanonicalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotADirectory(path) => write!(f, "{} is not a directory", path.display()),
            Self::Walk(err) => write!(f, "failed to walk snapshot directory: {err}"),
        }
    }
}

impl Error for CanonicalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotADirectory(_) => None,
            Self::Walk(err) => Some(err),
        }
    }
}
