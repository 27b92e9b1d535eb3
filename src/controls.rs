//! Command-line surfaces and the plain settings they produce.

use crate::compact::CompactionPolicy;
use crate::logging::LogFormat;
use crate::recompress::{GifPolicy, PassParams};
use crate::source_url::SignalPriority;
use crate::strip::{FilterSet, DEFAULT_STYLE_THRESHOLD};
use clap::{ArgAction, Parser};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;

/// Settings for a canonicalization run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameControls {
    apply: bool,
    priority: SignalPriority,
    jobs: usize,
}

impl RenameControls {
    /// Constructs rename settings; `jobs` is clamped to at least one.
    pub fn new(apply: bool, priority: SignalPriority, jobs: usize) -> Self {
        Self {
            apply,
            priority,
            jobs: jobs.max(1),
        }
    }

    /// Whether renames are performed rather than previewed.
    pub fn apply(&self) -> bool {
        self.apply
    }

    /// Order in which URL signals are consulted.
    pub fn priority(&self) -> SignalPriority {
        self.priority
    }

    /// Documents inspected concurrently.
    pub fn jobs(&self) -> usize {
        self.jobs
    }
}

impl Default for RenameControls {
    fn default() -> Self {
        Self::new(false, SignalPriority::default(), default_jobs())
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Settings for compacting one document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactControls {
    params: PassParams,
    target_bytes: Option<usize>,
    max_passes: Option<usize>,
    filters: FilterSet,
    extract_images: bool,
}

impl CompactControls {
    /// Constructs compaction settings.
    pub fn new(
        params: PassParams,
        target_bytes: Option<usize>,
        max_passes: Option<usize>,
        filters: FilterSet,
        extract_images: bool,
    ) -> Self {
        Self {
            params,
            target_bytes,
            max_passes,
            filters,
            extract_images,
        }
    }

    /// Encoder settings for the first pass.
    pub fn initial_params(&self) -> PassParams {
        self.params
    }

    /// Stripping filters to run first.
    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// Whether images go to an asset directory instead of staying inline.
    pub fn extract_images(&self) -> bool {
        self.extract_images
    }

    /// Budget-loop policy for a document currently `current_len` bytes long.
    /// Without an explicit target the budget is the current size, which makes
    /// the loop stop after one pass.
    pub fn policy_for(&self, current_len: usize) -> CompactionPolicy {
        CompactionPolicy {
            initial: self.params,
            target_bytes: self.target_bytes.unwrap_or(current_len),
            max_passes: self.max_passes,
        }
    }
}

impl Default for CompactControls {
    fn default() -> Self {
        Self::new(PassParams::default(), None, None, FilterSet::default(), false)
    }
}

/// Renames archived snapshots to canonical, collision-free names.
#[derive(Parser, Debug, Clone)]
#[command(name = "snapnorm_rename", version, about = "Canonical filenames for archived page snapshots")]
pub struct RenameCli {
    /// Directory to scan recursively
    #[arg(env = "SNAPNORM_DIR")]
    pub directory: Option<PathBuf>,

    /// Perform the renames (default is a dry run)
    #[arg(long, env = "SNAPNORM_APPLY", default_value_t = false)]
    pub apply: bool,

    /// Do not print the rename mapping
    #[arg(long, short, env = "SNAPNORM_QUIET", default_value_t = false)]
    pub quiet: bool,

    /// Prefer og:url over <link rel=canonical>
    #[arg(long, env = "SNAPNORM_NO_CANONICAL", default_value_t = false)]
    pub no_canonical: bool,

    /// Documents inspected concurrently (0 = one per CPU)
    #[arg(long, env = "SNAPNORM_JOBS", default_value_t = 0)]
    pub jobs: usize,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, env = "SNAPNORM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl RenameCli {
    /// Converts the parsed CLI into `RenameControls`.
    pub fn build_controls(&self) -> RenameControls {
        let priority = if self.no_canonical {
            SignalPriority::SocialFirst
        } else {
            SignalPriority::CanonicalFirst
        };
        let jobs = if self.jobs == 0 { default_jobs() } else { self.jobs };
        RenameControls::new(self.apply, priority, jobs)
    }
}

/// Shrinks a snapshot's inline assets toward a byte budget.
#[derive(Parser, Debug, Clone)]
#[command(name = "snapnorm_compact", version, about = "Compact inline assets of a page snapshot")]
pub struct CompactCli {
    /// Snapshot to compact (exactly one)
    pub files: Vec<PathBuf>,

    /// Largest width or height an image may keep
    #[arg(long = "maxWidth", env = "SNAPNORM_MAX_WIDTH", default_value_t = 1600)]
    pub max_width: u32,

    /// WebP quality for the first pass
    #[arg(long, env = "SNAPNORM_QUALITY", default_value_t = 70, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub quality: u8,

    /// Target document size in bytes (default: current size, single pass)
    #[arg(long = "targetBytes", env = "SNAPNORM_TARGET_BYTES")]
    pub target_bytes: Option<usize>,

    /// Stop after this many passes
    #[arg(long = "maxPasses", env = "SNAPNORM_MAX_PASSES")]
    pub max_passes: Option<usize>,

    /// Remove @font-face rules and font links
    #[arg(long = "strip-fonts", env = "SNAPNORM_STRIP_FONTS", default_value_t = false)]
    pub strip_fonts: bool,

    /// Remove <script> elements
    #[arg(long = "strip-scripts", env = "SNAPNORM_STRIP_SCRIPTS", default_value_t = false)]
    pub strip_scripts: bool,

    /// Remove Stripe iframes
    #[arg(long = "strip-stripe", env = "SNAPNORM_STRIP_STRIPE", default_value_t = false)]
    pub strip_stripe: bool,

    /// Remove <style> blocks larger than --styleThreshold
    #[arg(long = "strip-large-styles", env = "SNAPNORM_STRIP_LARGE_STYLES", default_value_t = false)]
    pub strip_large_styles: bool,

    /// Size in bytes above which a <style> block is large
    #[arg(long = "styleThreshold", env = "SNAPNORM_STYLE_THRESHOLD", default_value_t = DEFAULT_STYLE_THRESHOLD)]
    pub style_threshold: usize,

    /// Write images to <name>_files/ instead of keeping them inline
    #[arg(long = "extract-images", env = "SNAPNORM_EXTRACT_IMAGES", default_value_t = false)]
    pub extract_images: bool,

    /// Convert GIFs to animated WebP instead of keeping them as GIF
    #[arg(long = "gif-webp", env = "SNAPNORM_GIF_WEBP", default_value_t = false)]
    pub gif_webp: bool,

    /// Print the summary as JSON
    #[arg(long, env = "SNAPNORM_JSON", default_value_t = false)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, env = "SNAPNORM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CompactCli {
    /// Converts the parsed CLI into `CompactControls`.
    pub fn build_controls(&self) -> CompactControls {
        let params = PassParams {
            quality: self.quality,
            max_width: self.max_width,
            gif_policy: if self.gif_webp {
                GifPolicy::AnimatedWebp
            } else {
                GifPolicy::KeepGif
            },
        };
        let filters = FilterSet {
            fonts: self.strip_fonts,
            scripts: self.strip_scripts,
            tracking_iframes: self.strip_stripe,
            large_styles: self.strip_large_styles.then_some(self.style_threshold),
        };
        CompactControls::new(
            params,
            self.target_bytes,
            self.max_passes,
            filters,
            self.extract_images,
        )
    }
}
