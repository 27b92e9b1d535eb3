//! Optional filters that remove costly content before image compaction.

use crate::html::{rewrite, HtmlScanError};
use lol_html::html_content::ContentType;
use lol_html::{element, text};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use tracing::{info, warn};
use url::Url;

/// Default size above which an inline `<style>` block counts as large.
pub const DEFAULT_STYLE_THRESHOLD: usize = 128 * 1024;

const FONT_FACE: &str = "@font-face";
const FONT_DATA_PREFIXES: [&str; 3] = ["data:font", "data:application/font", "data:application/x-font"];
const TRACKING_FRAME_NAME_PREFIXES: [&str; 1] = ["__privateStripe"];
const TRACKING_FRAME_HOSTS: [&str; 4] = [
    "js.stripe.com",
    "m.stripe.network",
    "m.stripe.com",
    "hooks.stripe.com",
];

/// Bytes a filter took out of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    /// Input length minus output length.
    pub bytes_removed: usize,
}

impl FilterReport {
    fn between(before: &[u8], after: &[u8]) -> Self {
        Self {
            bytes_removed: before.len().saturating_sub(after.len()),
        }
    }
}

/// Removes `@font-face` rules from inline styles and font `<link>`s that
/// preload or embed font data.
///
/// Styles are read in a first pass; only those that actually hold a
/// `@font-face` block are re-emitted, so every other style keeps its bytes.
pub fn strip_fonts(document: &[u8]) -> Result<(Vec<u8>, FilterReport), StripError> {
    let styles = RefCell::new(Vec::<String>::new());
    rewrite(
        document,
        vec![
            element!("style", |_el| {
                styles.borrow_mut().push(String::new());
                Ok(())
            }),
            text!("style", |chunk| {
                if let Some(css) = styles.borrow_mut().last_mut() {
                    css.push_str(chunk.as_str());
                }
                Ok(())
            }),
        ],
    )?;
    let rewrites: Vec<Option<String>> = styles
        .into_inner()
        .iter()
        .map(|css| {
            let kept = remove_font_faces(css);
            (kept != *css).then_some(kept)
        })
        .collect();

    let index = Cell::new(0usize);
    let output = rewrite(
        document,
        vec![
            element!("style", |_el| {
                index.set(index.get() + 1);
                Ok(())
            }),
            text!("style", |chunk| {
                let Some(Some(kept)) = index.get().checked_sub(1).and_then(|at| rewrites.get(at)) else {
                    return Ok(());
                };
                if chunk.last_in_text_node() {
                    chunk.replace(kept, ContentType::Html);
                } else {
                    chunk.remove();
                }
                Ok(())
            }),
            element!("link", |el| {
                let preloads_font = el
                    .get_attribute("as")
                    .is_some_and(|value| value.trim().eq_ignore_ascii_case("font"));
                let embeds_font = el.get_attribute("href").is_some_and(|href| is_font_data_uri(&href));
                if preloads_font || embeds_font {
                    el.remove();
                }
                Ok(())
            }),
        ],
    )?;
    let report = FilterReport::between(document, &output);
    Ok((output, report))
}

fn is_font_data_uri(href: &str) -> bool {
    let href = href.trim();
    FONT_DATA_PREFIXES.iter().any(|prefix| {
        href.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Drops every `@font-face { ... }` block from a stylesheet. A block whose
/// braces never balance is left in place.
pub fn remove_font_faces(css: &str) -> String {
    let lowered = css.to_ascii_lowercase();
    let mut kept = String::with_capacity(css.len());
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(FONT_FACE) {
        let start = cursor + found;
        let marker_end = start + FONT_FACE.len();
        match block_end(css, marker_end) {
            Some(end) => {
                kept.push_str(&css[cursor..start]);
                cursor = end;
            }
            None => {
                kept.push_str(&css[cursor..marker_end]);
                cursor = marker_end;
            }
        }
    }
    kept.push_str(&css[cursor..]);
    kept
}

/// Offset just past the `}` closing the block that opens at or after `from`.
fn block_end(css: &str, from: usize) -> Option<usize> {
    let bytes = css.as_bytes();
    let open = from + css[from..].find('{')?;
    if !css[from..open].trim().is_empty() {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut idx = open;
    while idx < bytes.len() {
        let byte = bytes[idx];
        match quote {
            Some(_) if byte == b'\\' => idx += 1,
            Some(q) if byte == q => quote = None,
            Some(_) => {}
            None => match byte {
                b'"' | b'\'' => quote = Some(byte),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx + 1);
                    }
                }
                _ => {}
            },
        }
        idx += 1;
    }
    None
}

/// Removes `<script>` elements along with their content.
pub fn strip_scripts(document: &[u8]) -> Result<(Vec<u8>, FilterReport), StripError> {
    let output = rewrite(
        document,
        vec![element!("script", |el| {
            el.remove();
            Ok(())
        })],
    )?;
    let report = FilterReport::between(document, &output);
    Ok((output, report))
}

/// Removes `<style>` elements whose text is longer than `threshold` bytes.
///
/// Text arrives in chunks after the element's start tag, so the sizes are
/// measured in a first pass and applied in a second.
pub fn strip_large_styles(
    document: &[u8],
    threshold: usize,
) -> Result<(Vec<u8>, FilterReport), StripError> {
    let sizes = RefCell::new(Vec::<usize>::new());
    rewrite(
        document,
        vec![
            element!("style", |_el| {
                sizes.borrow_mut().push(0);
                Ok(())
            }),
            text!("style", |chunk| {
                if let Some(size) = sizes.borrow_mut().last_mut() {
                    *size += chunk.as_str().len();
                }
                Ok(())
            }),
        ],
    )?;

    let sizes = sizes.into_inner();
    if sizes.iter().all(|&size| size <= threshold) {
        return Ok((document.to_vec(), FilterReport::default()));
    }
    let index = Cell::new(0usize);
    let output = rewrite(
        document,
        vec![element!("style", |el| {
            let current = index.get();
            index.set(current + 1);
            if sizes.get(current).is_some_and(|&size| size > threshold) {
                el.remove();
            }
            Ok(())
        })],
    )?;
    let report = FilterReport::between(document, &output);
    Ok((output, report))
}

/// Removes iframes injected by known payment/tracking widgets.
pub fn strip_tracking_iframes(document: &[u8]) -> Result<(Vec<u8>, FilterReport), StripError> {
    let output = rewrite(
        document,
        vec![element!("iframe", |el| {
            let by_name = el.get_attribute("name").is_some_and(|name| {
                TRACKING_FRAME_NAME_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
            });
            let by_host = el.get_attribute("src").is_some_and(|src| is_tracking_src(&src));
            if by_name || by_host {
                el.remove();
            }
            Ok(())
        })],
    )?;
    let report = FilterReport::between(document, &output);
    Ok((output, report))
}

fn is_tracking_src(src: &str) -> bool {
    let src = src.trim();
    let parsed = match src.strip_prefix("//") {
        Some(rest) => Url::parse(&format!("https://{rest}")),
        None => Url::parse(src),
    };
    parsed
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| TRACKING_FRAME_HOSTS.contains(&host.as_str()))
}

/// Identifies a stripping filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// [`strip_fonts`].
    Fonts,
    /// [`strip_scripts`].
    Scripts,
    /// [`strip_tracking_iframes`].
    TrackingIframes,
    /// [`strip_large_styles`].
    LargeStyles,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fonts => "fonts",
            Self::Scripts => "scripts",
            Self::TrackingIframes => "tracking iframes",
            Self::LargeStyles => "large styles",
        })
    }
}

/// Bytes removed by one filter in a [`FilterSet::apply`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterOutcome {
    /// Filter that ran.
    pub kind: FilterKind,
    /// What it removed.
    pub report: FilterReport,
}

/// Which filters to run. All are off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSet {
    /// Run [`strip_fonts`].
    pub fonts: bool,
    /// Run [`strip_scripts`].
    pub scripts: bool,
    /// Run [`strip_tracking_iframes`].
    pub tracking_iframes: bool,
    /// Run [`strip_large_styles`] with this threshold.
    pub large_styles: Option<usize>,
}

impl FilterSet {
    /// Runs the enabled filters in order. A filter that fails is logged and
    /// skipped; the document it was given carries on to the next one.
    pub fn apply(&self, document: &[u8]) -> (Vec<u8>, Vec<FilterOutcome>) {
        let mut current = document.to_vec();
        let mut outcomes = Vec::new();
        let enabled = [
            (self.fonts, FilterKind::Fonts),
            (self.scripts, FilterKind::Scripts),
            (self.tracking_iframes, FilterKind::TrackingIframes),
            (self.large_styles.is_some(), FilterKind::LargeStyles),
        ];
        for (_, kind) in enabled.into_iter().filter(|(on, _)| *on) {
            let result = match kind {
                FilterKind::Fonts => strip_fonts(&current),
                FilterKind::Scripts => strip_scripts(&current),
                FilterKind::TrackingIframes => strip_tracking_iframes(&current),
                FilterKind::LargeStyles => strip_large_styles(
                    &current,
                    self.large_styles.unwrap_or(DEFAULT_STYLE_THRESHOLD),
                ),
            };
            match result {
                Ok((output, report)) => {
                    info!(filter = %kind, removed = report.bytes_removed, "filter applied");
                    current = output;
                    outcomes.push(FilterOutcome { kind, report });
                }
                Err(err) => warn!(filter = %kind, error = %err, "filter failed, skipping"),
            }
        }
        (current, outcomes)
    }
}

/// A filter could not rewrite the document.
#[derive(Debug)]
pub enum StripError {
    /// The HTML rewriter failed.
    Html(HtmlScanError),
}

impl From<HtmlScanError> for StripError {
    fn from(err: HtmlScanError) -> Self {
        Self::Html(err)
    }
}

impl fmt::Display for StripError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Html(err) => write!(f, "strip filter failed: {err}"),
        }
    }
}

impl Error for StripError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Html(err) => Some(err),
        }
    }
}
