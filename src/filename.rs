//! Canonical snapshot filenames.
//!
//! A canonical name has three parts: the flattened source URL, a capture
//! timestamp, and the original extension:
//!
//! ```text
//! https__example.com_docs_intro-2024-01-05T10_20_30_123Z.html
//! ```
//!
//! Everything here is pure string work; nothing touches the filesystem.

use crate::fullwidth;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use url::Url;

/// Snapshot extensions, longest first so compound forms win.
pub const SNAPSHOT_EXTENSIONS: [&str; 4] = ["u.zip.html", "zip.html", "html", "zip"];

/// Separator replacing `/` in flattened URLs.
pub const PATH_DELIMITER: char = '_';

/// Replacement for characters that are unsafe in filenames.
pub const PLACEHOLDER: char = '_';

const MAX_FLATTENED_BYTES: usize = 180;
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const BOUNDARY_NOISE: &[char] = &['_', '-', '.', ' '];

static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})-(\d{2})-(\d{2})[T ](\d{2})[:_.](\d{2})[:_.](\d{2})(?:[._:](\d{1,3}))?",
    )
    .expect("timestamp pattern")
});

/// Splits `name` into stem and extension, matching compound snapshot
/// extensions before falling back to the last dot. The extension is returned
/// exactly as written.
pub fn split_extension(name: &str) -> (&str, &str) {
    for ext in SNAPSHOT_EXTENSIONS {
        if let Some(stem_len) = name.len().checked_sub(ext.len() + 1) {
            if stem_len > 0
                && name.is_char_boundary(stem_len)
                && name[stem_len..].starts_with('.')
                && name[stem_len + 1..].eq_ignore_ascii_case(ext)
            {
                return (&name[..stem_len], &name[stem_len + 1..]);
            }
        }
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

/// True when `name` carries one of the snapshot extensions.
pub fn is_snapshot_name(name: &str) -> bool {
    let (_, ext) = split_extension(name);
    SNAPSHOT_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
}

fn join_name(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// Capture time embedded in a snapshot filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTimestamp {
    date: NaiveDate,
    hour: u32,
    minute: u32,
    second: u32,
    millis: u32,
}

impl SnapshotTimestamp {
    /// Finds the last timestamp in `name`, accepting `:`, `：`, `_` or `.` as
    /// time separators.
    pub fn find_in(name: &str) -> Option<Self> {
        let decoded = fullwidth::decode(name);
        TIMESTAMP
            .captures_iter(&decoded)
            .filter_map(|caps| {
                let num = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());
                let date = NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)?;
                let (hour, minute, second) = (num(4)?, num(5)?, num(6)?);
                if hour > 23 || minute > 59 || second > 60 {
                    return None;
                }
                let millis = match caps.get(7) {
                    Some(frac) => format!("{:0<3}", frac.as_str()).parse().ok()?,
                    None => 0,
                };
                Some(Self {
                    date,
                    hour,
                    minute,
                    second,
                    millis,
                })
            })
            .last()
    }

    /// Timestamp for a wall-clock instant.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            date: at.date_naive(),
            hour: at.hour(),
            minute: at.minute(),
            second: at.second(),
            millis: at.timestamp_subsec_millis().min(999),
        }
    }
}

impl fmt::Display for SnapshotTimestamp {
    /// Renders `YYYY-MM-DDTHH_MM_SS_mmm`, which sorts lexicographically.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}T{:02}_{:02}_{:02}_{:03}",
            self.date.format("%Y-%m-%d"),
            self.hour,
            self.minute,
            self.second,
            self.millis
        )
    }
}

/// Maps a URL to `scheme__host_path_segments`.
///
/// The port, query and fragment never appear. A path ending in `/` keeps an
/// extra trailing delimiter so `/x/` and `/x` stay distinct.
pub fn flatten_url(url: &Url) -> String {
    let mut flat = format!(
        "{}{PATH_DELIMITER}{PATH_DELIMITER}{}",
        url.scheme().to_ascii_lowercase(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    let path = url.path();
    if !path.is_empty() && path != "/" {
        let inner = path.strip_prefix('/').unwrap_or(path);
        let (inner, trailing) = match inner.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (inner, false),
        };
        flat.push(PATH_DELIMITER);
        flat.extend(inner.chars().map(|ch| if ch == '/' { PATH_DELIMITER } else { ch }));
        if trailing {
            flat.push(PATH_DELIMITER);
        }
    }
    truncate_on_char_boundary(&mut flat, MAX_FLATTENED_BYTES);
    flat
}

fn truncate_on_char_boundary(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

/// Makes a filename safe for any common filesystem.
///
/// Control characters, whitespace and reserved punctuation in the stem become
/// a single [`PLACEHOLDER`] per run; stray delimiters are trimmed from both
/// ends of the stem. The extension is kept verbatim.
pub fn sanitize_file_name(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let mut clean = String::with_capacity(stem.len());
    let mut in_unsafe_run = false;
    for ch in stem.chars() {
        if ch.is_control() || ch.is_whitespace() || RESERVED.contains(&ch) {
            if !in_unsafe_run {
                clean.push(PLACEHOLDER);
            }
            in_unsafe_run = true;
        } else {
            clean.push(ch);
            in_unsafe_run = false;
        }
    }
    let trimmed = clean.trim_matches(BOUNDARY_NOISE);
    let stem = if trimmed.is_empty() { "untitled" } else { trimmed };
    join_name(stem, ext)
}

/// Builds the canonical name for a snapshot of `url` captured at `stamp`.
pub fn compose_canonical_name(url: &Url, stamp: SnapshotTimestamp, ext: &str) -> String {
    let stem = format!("{}-{stamp}Z", flatten_url(url));
    sanitize_file_name(&join_name(&stem, ext))
}

/// Appends a collision suffix before the extension: `name-2.zip.html`.
pub fn with_collision_suffix(name: &str, n: u32) -> String {
    let (stem, ext) = split_extension(name);
    join_name(&format!("{stem}-{n}"), ext)
}

/// Why a file keeps its current name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// No usable source URL and nothing to normalize in the name.
    NoSourceUrl,
    /// The computed name equals the current one.
    AlreadyCanonical,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSourceUrl => write!(f, "no source url"),
            Self::AlreadyCanonical => write!(f, "already canonical"),
        }
    }
}

/// Outcome of planning a file's name, before collisions are considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePlan {
    /// Leave the file alone.
    Keep(NoOpReason),
    /// Move the file to `desired` (subject to collision resolution).
    Rename {
        /// Sanitized target name.
        desired: String,
    },
}

/// Decides the name a snapshot should carry.
///
/// With a source URL the name is rebuilt from it, reusing a timestamp already
/// present in `current` or falling back to `now`. Without one only full-width
/// punctuation in the existing name is normalized; a name without any is left
/// untouched rather than guessed at.
pub fn plan_file_name(current: &str, source_url: Option<&Url>, now: DateTime<Utc>) -> NamePlan {
    let desired = match source_url {
        Some(url) => {
            let (_, ext) = split_extension(current);
            let stamp = SnapshotTimestamp::find_in(current)
                .unwrap_or_else(|| SnapshotTimestamp::from_datetime(now));
            compose_canonical_name(url, stamp, ext)
        }
        None => {
            let decoded = fullwidth::decode(current);
            if decoded == current {
                return NamePlan::Keep(NoOpReason::NoSourceUrl);
            }
            sanitize_file_name(&decoded)
        }
    };
    if desired == current {
        NamePlan::Keep(NoOpReason::AlreadyCanonical)
    } else {
        NamePlan::Rename { desired }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("url")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 8, 7, 6).single().expect("time")
            + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn splits_compound_extensions_first() {
        assert_eq!(split_extension("page.u.zip.html"), ("page", "u.zip.html"));
        assert_eq!(split_extension("page.zip.html"), ("page", "zip.html"));
        assert_eq!(split_extension("page.HTML"), ("page", "HTML"));
        assert_eq!(split_extension("page.zip"), ("page", "zip"));
        assert_eq!(split_extension("notes.txt"), ("notes", "txt"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".html"), (".html", ""));
    }

    #[test]
    fn recognizes_snapshot_names() {
        assert!(is_snapshot_name("a.html"));
        assert!(is_snapshot_name("a.u.zip.html"));
        assert!(is_snapshot_name("a.ZIP"));
        assert!(!is_snapshot_name("a.htm.bak"));
        assert!(!is_snapshot_name("a.png"));
    }

    #[test]
    fn flattens_scheme_host_and_path() {
        assert_eq!(flatten_url(&url("https://Ex.com:8443/a/b?q=1#f")), "https__ex.com_a_b");
        assert_eq!(flatten_url(&url("http://ex.com/")), "http__ex.com");
        assert_eq!(flatten_url(&url("http://ex.com")), "http__ex.com");
    }

    #[test]
    fn trailing_slash_is_preserved() {
        let with = flatten_url(&url("https://a.com/x/"));
        let without = flatten_url(&url("https://a.com/x"));
        assert_eq!(with, "https__a.com_x_");
        assert_eq!(without, "https__a.com_x");
        assert_ne!(with, without);
    }

    #[test]
    fn long_urls_are_capped() {
        let long = format!("https://ex.com/{}", "segment/".repeat(60));
        assert!(flatten_url(&url(&long)).len() <= MAX_FLATTENED_BYTES);
    }

    #[test]
    fn timestamps_are_normalized() {
        let found = SnapshotTimestamp::find_in("Title (2024-01-05T10：20：30.5Z).html").expect("stamp");
        assert_eq!(found.to_string(), "2024-01-05T10_20_30_500");
        let found = SnapshotTimestamp::find_in("x-2024-01-05 10_20_30.html").expect("stamp");
        assert_eq!(found.to_string(), "2024-01-05T10_20_30_000");
        assert_eq!(SnapshotTimestamp::find_in("2024-13-45T10_20_30.html"), None);
        assert_eq!(
            SnapshotTimestamp::from_datetime(now()).to_string(),
            "2024-03-09T08_07_06_042"
        );
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_file_name("a:b?c.html"), "a_b_c.html");
        assert_eq!(sanitize_file_name("a  \t b.html"), "a_b.html");
        assert_eq!(sanitize_file_name("__a__-.zip.html"), "a.zip.html");
        assert_eq!(sanitize_file_name("xn--bcher-kva.html"), "xn--bcher-kva.html");
        assert_eq!(sanitize_file_name("\u{7}.html"), "untitled.html");
    }

    #[test]
    fn composes_the_documented_grammar() {
        let stamp = SnapshotTimestamp::from_datetime(now());
        assert_eq!(
            compose_canonical_name(&url("https://ex.com/docs/intro"), stamp, "u.zip.html"),
            "https__ex.com_docs_intro-2024-03-09T08_07_06_042Z.u.zip.html"
        );
    }

    #[test]
    fn collision_suffix_goes_before_compound_extension() {
        assert_eq!(with_collision_suffix("page-1.html", 2), "page-1-2.html");
        assert_eq!(with_collision_suffix("p.zip.html", 3), "p-3.zip.html");
    }

    #[test]
    fn plan_reuses_embedded_timestamp() {
        let plan = plan_file_name(
            "Some Title (2023-12-31T23：59：59.999Z).html",
            Some(&url("https://ex.com/a")),
            now(),
        );
        assert_eq!(
            plan,
            NamePlan::Rename {
                desired: "https__ex.com_a-2023-12-31T23_59_59_999Z.html".to_string()
            }
        );
    }

    #[test]
    fn plan_synthesizes_timestamp_when_missing() {
        let plan = plan_file_name("page.html", Some(&url("https://ex.com/a/")), now());
        assert_eq!(
            plan,
            NamePlan::Rename {
                desired: "https__ex.com_a_-2024-03-09T08_07_06_042Z.html".to_string()
            }
        );
    }

    #[test]
    fn plan_is_idempotent_on_canonical_names() {
        let name = "https__ex.com_a-2023-12-31T23_59_59_999Z.html";
        assert_eq!(
            plan_file_name(name, Some(&url("https://ex.com/a")), now()),
            NamePlan::Keep(NoOpReason::AlreadyCanonical)
        );
    }

    #[test]
    fn plan_without_url_only_normalizes_punctuation() {
        assert_eq!(
            plan_file_name("Plain title.html", None, now()),
            NamePlan::Keep(NoOpReason::NoSourceUrl)
        );
        assert_eq!(
            plan_file_name("ＮＨＫニュース２０２４.html", None, now()),
            NamePlan::Keep(NoOpReason::NoSourceUrl)
        );
        assert_eq!(
            plan_file_name("Q＆A：part 1.html", None, now()),
            NamePlan::Rename {
                desired: "Q&A_part_1.html".to_string()
            }
        );
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn flattening_is_deterministic(host in "[a-z]{1,12}\\.(com|org|net)", path in "(/[a-zA-Z0-9_-]{1,8}){0,5}") {
                let url = Url::parse(&format!("https://{host}{path}")).expect("url");
                prop_assert_eq!(flatten_url(&url), flatten_url(&url));
            }

            #[test]
            fn trailing_slash_never_collides(host in "[a-z]{1,12}\\.com", path in "(/[a-zA-Z0-9-]{1,8}){1,5}") {
                let bare = Url::parse(&format!("https://{host}{path}")).expect("url");
                let slashed = Url::parse(&format!("https://{host}{path}/")).expect("url");
                prop_assert_ne!(flatten_url(&bare), flatten_url(&slashed));
            }

            #[test]
            fn composed_names_are_filesystem_safe(path in "(/[^/?#]{1,8}){0,4}") {
                let Ok(url) = Url::parse(&format!("https://ex.com{path}")) else {
                    return Ok(());
                };
                let stamp = SnapshotTimestamp::from_datetime(chrono::Utc::now());
                let name = compose_canonical_name(&url, stamp, "html");
                prop_assert!(!name.contains(RESERVED));
                prop_assert!(!name.chars().any(|ch| ch.is_control() || ch.is_whitespace()));
            }
        }
    }
}
