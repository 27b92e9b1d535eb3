//! Streaming HTML helpers built on `lol_html`.

use lol_html::html_content::{Comment, Element};
use lol_html::{doc_comments, element, ElementContentHandlers, HtmlRewriter, Selector, Settings};
use std::borrow::Cow;
use std::cell::RefCell;
use std::error::Error;
use std::fmt;

const SAVED_FROM_MARKER: &str = "saved from url=";

/// Raw source-URL candidates found in a document, each in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlSignals {
    /// `href` values of `<link rel="canonical">`.
    pub canonical: Vec<String>,
    /// `content` values of `og:url` meta tags.
    pub open_graph: Vec<String>,
    /// `content` values of `twitter:url` meta tags.
    pub twitter: Vec<String>,
    /// URLs carried by `saved from url=(NNNN)...` comments.
    pub saved_from: Vec<String>,
}

/// Streams `document` once, collecting every source-URL signal.
///
/// Attribute values are returned as written; entity decoding and URL
/// validation happen in [`crate::source_url`].
pub fn collect_url_signals(document: &[u8]) -> Result<UrlSignals, HtmlScanError> {
    let signals = RefCell::new(UrlSignals::default());

    let link_handler = element!("link[href]", |el| {
        if is_canonical_link(el) {
            if let Some(href) = el.get_attribute("href") {
                signals.borrow_mut().canonical.push(href);
            }
        }
        Ok(())
    });

    let meta_handler = element!("meta[content]", |el| {
        let Some(content) = el.get_attribute("content") else {
            return Ok(());
        };
        for key_attr in ["property", "name"] {
            let Some(key) = el.get_attribute(key_attr) else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("og:url") {
                signals.borrow_mut().open_graph.push(content);
                break;
            }
            if key.eq_ignore_ascii_case("twitter:url") {
                signals.borrow_mut().twitter.push(content);
                break;
            }
        }
        Ok(())
    });

    let comment_handler = doc_comments!(|comment: &mut Comment<'_>| {
        if let Some(url) = saved_from_url(&comment.text()) {
            signals.borrow_mut().saved_from.push(url);
        }
        Ok(())
    });

    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![link_handler, meta_handler],
                document_content_handlers: vec![comment_handler],
                strict: false,
                ..Settings::default()
            },
            NoopSink,
        );
        rewriter.write(document).map_err(HtmlScanError::Rewrite)?;
        rewriter.end().map_err(HtmlScanError::Rewrite)?;
    }

    Ok(signals.into_inner())
}

/// Runs `document` through a non-strict rewriter with the given handlers and
/// returns the rewritten bytes.
pub fn rewrite<'h, 's>(
    document: &[u8],
    element_content_handlers: Vec<(Cow<'s, Selector>, ElementContentHandlers<'h>)>,
) -> Result<Vec<u8>, HtmlScanError> {
    let mut output = Vec::with_capacity(document.len());
    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers,
                strict: false,
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );
        rewriter.write(document).map_err(HtmlScanError::Rewrite)?;
        rewriter.end().map_err(HtmlScanError::Rewrite)?;
    }
    Ok(output)
}

fn is_canonical_link(el: &Element<'_, '_>) -> bool {
    el.get_attribute("rel").is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("canonical"))
    })
}

/// Pulls the URL out of a `saved from url=(0042)https://...` comment body.
pub fn saved_from_url(comment: &str) -> Option<String> {
    let lowered = comment.to_ascii_lowercase();
    let start = lowered.find(SAVED_FROM_MARKER)? + SAVED_FROM_MARKER.len();
    let mut rest = comment[start..].trim_start();
    if let Some(after_paren) = rest.strip_prefix('(') {
        let close = after_paren.find(')')?;
        rest = &after_paren[close + 1..];
    }
    let url: String = rest
        .trim_start()
        .chars()
        .take_while(|ch| !ch.is_whitespace())
        .collect();
    (!url.is_empty()).then_some(url)
}

/// Errors surfaced while streaming HTML.
#[derive(Debug)]
pub enum HtmlScanError {
    /// The HTML rewriter gave up on the document.
    Rewrite(lol_html::errors::RewritingError),
}

impl fmt::Display for HtmlScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rewrite(err) => write!(f, "html rewrite error: {err}"),
        }
    }
}

impl Error for HtmlScanError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rewrite(err) => Some(err),
        }
    }
}

struct NoopSink;

impl lol_html::OutputSink for NoopSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn collects_all_signal_kinds_in_order() {
        let html = br#"<!DOCTYPE html>
<!-- saved from url=(0029)https://saved.example.com/p -->
<html><head>
<link rel="stylesheet" href="/a.css">
<link rel="Canonical" href="https://ex.com/a">
<meta property="og:url" content="https://ex.com/b">
<meta name="twitter:url" content="https://ex.com/c">
<meta name="og:url" content="https://ex.com/b2">
</head><body></body></html>"#;

        let signals = collect_url_signals(html).expect("scan");
        assert_eq!(
            signals,
            UrlSignals {
                canonical: vec!["https://ex.com/a".to_string()],
                open_graph: vec![
                    "https://ex.com/b".to_string(),
                    "https://ex.com/b2".to_string()
                ],
                twitter: vec!["https://ex.com/c".to_string()],
                saved_from: vec!["https://saved.example.com/p".to_string()],
            }
        );
    }

    #[test]
    fn tolerates_unclosed_markup() {
        let html = b"<html><head><link rel=canonical href=https://ex.com/x><body><div><p>unclosed";
        let signals = collect_url_signals(html).expect("scan");
        assert_eq!(signals.canonical, vec!["https://ex.com/x".to_string()]);
    }

    #[test]
    fn parses_saved_from_comment_variants() {
        assert_eq!(
            saved_from_url(" saved from url=(0023)https://ex.com/page "),
            Some("https://ex.com/page".to_string())
        );
        assert_eq!(
            saved_from_url("Saved From URL=https://ex.com/x"),
            Some("https://ex.com/x".to_string())
        );
        assert_eq!(saved_from_url(" unrelated comment "), None);
        assert_eq!(saved_from_url("saved from url=(0000) "), None);
    }

    #[test]
    fn rewrite_applies_handlers() {
        let html = b"<p>keep</p><script>drop()</script>";
        let out = rewrite(
            html,
            vec![element!("script", |el| {
                el.remove();
                Ok(())
            })],
        )
        .expect("rewrite");
        assert_eq!(out, b"<p>keep</p>".to_vec());
    }
}
