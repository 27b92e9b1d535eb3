//! Collision-free target names.
//!
//! A desired name that is already taken gets a numeric suffix before its
//! extension (`page-1.html` becomes `page-1-2.html`). Resolution runs against
//! a [`Namespace`] so dry runs can preview the renames an apply run makes.

use crate::filename::with_collision_suffix;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_SUFFIX: u32 = 10_000;

/// Answers whether a name is occupied in one directory.
pub trait Namespace {
    /// True when `name` is taken in `dir`.
    fn exists(&self, dir: &Path, name: &str) -> bool;
}

/// The live filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskNamespace;

impl Namespace for DiskNamespace {
    fn exists(&self, dir: &Path, name: &str) -> bool {
        dir.join(name).symlink_metadata().is_ok()
    }
}

/// The filesystem overlaid with renames that have been planned but not
/// performed.
#[derive(Debug, Default)]
pub struct PlannedNamespace {
    claimed: HashSet<PathBuf>,
    released: HashSet<PathBuf>,
}

impl PlannedNamespace {
    /// Creates an overlay with nothing planned.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a planned move of `from` to `to` inside `dir`.
    pub fn record_rename(&mut self, dir: &Path, from: &str, to: &str) {
        let from = dir.join(from);
        let to = dir.join(to);
        self.claimed.remove(&from);
        self.released.insert(from);
        self.released.remove(&to);
        self.claimed.insert(to);
    }
}

impl Namespace for PlannedNamespace {
    fn exists(&self, dir: &Path, name: &str) -> bool {
        let path = dir.join(name);
        if self.claimed.contains(&path) {
            return true;
        }
        !self.released.contains(&path) && DiskNamespace.exists(dir, name)
    }
}

/// Where a file should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The file already carries the name it would receive.
    Unchanged,
    /// A free name to move the file to.
    Available(String),
}

/// Picks the first free name among `desired`, `desired-2`, `desired-3`, ...
///
/// Landing on `current` counts as [`Resolution::Unchanged`], so a file that
/// was suffixed by an earlier run is not renamed again.
pub fn resolve_name(
    dir: &Path,
    current: &str,
    desired: &str,
    namespace: &impl Namespace,
) -> Result<Resolution, CollisionError> {
    for candidate in candidates(desired) {
        if candidate == current {
            return Ok(Resolution::Unchanged);
        }
        if !namespace.exists(dir, &candidate) {
            return Ok(Resolution::Available(candidate));
        }
    }
    Err(CollisionError::Exhausted {
        desired: desired.to_string(),
    })
}

/// Moves `dir/current` to the first free candidate name without ever
/// replacing an existing file, returning the resolution that was applied.
///
/// The target is claimed with a hard link, which fails atomically when the
/// name is taken; the source is removed afterwards. Filesystems without hard
/// links fall back to check-then-rename, which is not atomic across
/// processes.
pub fn rename_no_clobber(
    dir: &Path,
    current: &str,
    desired: &str,
) -> Result<Resolution, CollisionError> {
    let source = dir.join(current);
    for candidate in candidates(desired) {
        if candidate == current {
            return Ok(Resolution::Unchanged);
        }
        let target = dir.join(&candidate);
        match fs::hard_link(&source, &target) {
            Ok(()) => {
                fs::remove_file(&source).map_err(|err| CollisionError::io(&source, err))?;
                return Ok(Resolution::Available(candidate));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(target = %target.display(), "name taken, trying next suffix");
            }
            Err(err) => {
                debug!(error = %err, "hard link unavailable, falling back to rename");
                if DiskNamespace.exists(dir, &candidate) {
                    continue;
                }
                fs::rename(&source, &target).map_err(|err| CollisionError::io(&source, err))?;
                return Ok(Resolution::Available(candidate));
            }
        }
    }
    Err(CollisionError::Exhausted {
        desired: desired.to_string(),
    })
}

fn candidates(desired: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(desired.to_string())
        .chain((2..=MAX_SUFFIX).map(move |n| with_collision_suffix(desired, n)))
}

/// Errors raised while claiming a name.
#[derive(Debug)]
pub enum CollisionError {
    /// Every suffix up to the limit is taken.
    Exhausted {
        /// Name the suffixes were derived from.
        desired: String,
    },
    /// The filesystem refused the move.
    Io {
        /// File being moved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl CollisionError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for CollisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { desired } => {
                write!(f, "no free name derived from {desired} (tried {MAX_SUFFIX} suffixes)")
            }
            Self::Io { path, source } => write!(f, "failed to rename {}: {source}", path.display()),
        }
    }
}

impl Error for CollisionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Exhausted { .. } => None,
            Self::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), name).expect("write");
    }

    #[test]
    fn free_name_is_used_as_is() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "old.html");
        assert_eq!(
            resolve_name(dir.path(), "old.html", "new.html", &DiskNamespace).expect("resolve"),
            Resolution::Available("new.html".to_string())
        );
    }

    #[test]
    fn taken_name_gets_suffix_before_extension() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "page-1.html");
        touch(dir.path(), "other.html");
        assert_eq!(
            resolve_name(dir.path(), "other.html", "page-1.html", &DiskNamespace).expect("resolve"),
            Resolution::Available("page-1-2.html".to_string())
        );
    }

    #[test]
    fn earlier_suffixed_name_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "page.zip.html");
        touch(dir.path(), "page-2.zip.html");
        assert_eq!(
            resolve_name(dir.path(), "page-2.zip.html", "page.zip.html", &DiskNamespace)
                .expect("resolve"),
            Resolution::Unchanged
        );
    }

    #[test]
    fn planned_namespace_tracks_pending_moves() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "a.html");
        touch(dir.path(), "b.html");
        let mut planned = PlannedNamespace::new();
        planned.record_rename(dir.path(), "a.html", "target.html");

        assert!(planned.exists(dir.path(), "target.html"));
        assert!(!planned.exists(dir.path(), "a.html"));
        assert_eq!(
            resolve_name(dir.path(), "b.html", "target.html", &planned).expect("resolve"),
            Resolution::Available("target-2.html".to_string())
        );
        assert_eq!(
            resolve_name(dir.path(), "b.html", "a.html", &planned).expect("resolve"),
            Resolution::Available("a.html".to_string())
        );
    }

    #[test]
    fn rename_never_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "taken.html");
        touch(dir.path(), "mine.html");

        let applied = rename_no_clobber(dir.path(), "mine.html", "taken.html").expect("rename");
        assert_eq!(applied, Resolution::Available("taken-2.html".to_string()));
        assert_eq!(fs::read_to_string(dir.path().join("taken.html")).expect("read"), "taken.html");
        assert_eq!(fs::read_to_string(dir.path().join("taken-2.html")).expect("read"), "mine.html");
        assert!(!dir.path().join("mine.html").exists());
    }

    #[test]
    fn rename_to_own_name_is_noop() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "same.html");
        assert_eq!(
            rename_no_clobber(dir.path(), "same.html", "same.html").expect("rename"),
            Resolution::Unchanged
        );
        assert!(dir.path().join("same.html").exists());
    }
}
