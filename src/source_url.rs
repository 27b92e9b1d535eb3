//! Picks the single best source URL for a snapshot.

use crate::fullwidth;
use crate::html::{collect_url_signals, HtmlScanError, UrlSignals};
use url::Url;

/// Metadata signals that can name a snapshot's source page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSignal {
    /// `<link rel="canonical">`.
    Canonical,
    /// Open Graph `og:url`.
    OpenGraph,
    /// Twitter card `twitter:url`.
    Twitter,
    /// Capture-tool `saved from url=` comment.
    SavedFrom,
}

/// Order in which signals are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalPriority {
    /// Canonical link first, then Open Graph.
    #[default]
    CanonicalFirst,
    /// Open Graph first, then the canonical link.
    SocialFirst,
}

impl SignalPriority {
    /// Signals in the order they are tried.
    pub fn order(self) -> [UrlSignal; 4] {
        match self {
            Self::CanonicalFirst => [
                UrlSignal::Canonical,
                UrlSignal::OpenGraph,
                UrlSignal::Twitter,
                UrlSignal::SavedFrom,
            ],
            Self::SocialFirst => [
                UrlSignal::OpenGraph,
                UrlSignal::Canonical,
                UrlSignal::Twitter,
                UrlSignal::SavedFrom,
            ],
        }
    }
}

/// Extracts and normalizes the best source URL, or `None` when no signal
/// yields a usable http(s) URL.
pub fn extract_source_url(
    document: &[u8],
    priority: SignalPriority,
) -> Result<Option<Url>, HtmlScanError> {
    let signals = collect_url_signals(document)?;
    Ok(pick_source_url(&signals, priority))
}

/// Applies the priority order to already-collected signals.
pub fn pick_source_url(signals: &UrlSignals, priority: SignalPriority) -> Option<Url> {
    priority.order().into_iter().find_map(|signal| {
        candidates(signals, signal)
            .iter()
            .find_map(|raw| normalize_candidate(raw))
    })
}

fn candidates(signals: &UrlSignals, signal: UrlSignal) -> &[String] {
    match signal {
        UrlSignal::Canonical => &signals.canonical,
        UrlSignal::OpenGraph => &signals.open_graph,
        UrlSignal::Twitter => &signals.twitter,
        UrlSignal::SavedFrom => &signals.saved_from,
    }
}

/// Cleans a raw candidate into a stable source URL.
///
/// Query string and fragment are dropped so re-captures of one page with
/// different tracking parameters agree.
pub fn normalize_candidate(raw: &str) -> Option<Url> {
    let unescaped = html_escape::decode_html_entities(raw);
    let decoded = fullwidth::decode(&unescaped);
    let trimmed = decoded.trim_matches(|ch: char| ch.is_whitespace() || is_quote(ch));
    if !has_http_prefix(trimmed) {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url)
}

fn is_quote(ch: char) -> bool {
    matches!(ch, '"' | '\'' | '`' | '\u{201C}' | '\u{201D}' | '\u{2018}' | '\u{2019}')
}

fn has_http_prefix(candidate: &str) -> bool {
    ["http://", "https://"].iter().any(|prefix| {
        candidate
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BOTH: &[u8] = br#"<html><head>
<link rel="canonical" href="https://ex.com/a">
<meta property="og:url" content="https://ex.com/b">
</head></html>"#;

    fn extract(doc: &[u8], priority: SignalPriority) -> Option<String> {
        extract_source_url(doc, priority)
            .expect("scan")
            .map(|url| url.to_string())
    }

    #[test]
    fn canonical_wins_by_default() {
        assert_eq!(
            extract(BOTH, SignalPriority::CanonicalFirst),
            Some("https://ex.com/a".to_string())
        );
    }

    #[test]
    fn social_first_prefers_open_graph() {
        assert_eq!(
            extract(BOTH, SignalPriority::SocialFirst),
            Some("https://ex.com/b".to_string())
        );
    }

    #[test]
    fn falls_through_invalid_candidates() {
        let doc = br#"<link rel="canonical" href="/relative/path">
<meta property="og:url" content="ftp://ex.com/file">
<meta name="twitter:url" content=" 'https://EX.com/t?utm_source=x#frag' ">"#;
        assert_eq!(
            extract(doc, SignalPriority::CanonicalFirst),
            Some("https://ex.com/t".to_string())
        );
    }

    #[test]
    fn saved_from_comment_is_last_resort() {
        let doc = b"<!-- saved from url=(0026)https://saved.ex.com/page -->\n<html></html>";
        assert_eq!(
            extract(doc, SignalPriority::CanonicalFirst),
            Some("https://saved.ex.com/page".to_string())
        );
    }

    #[test]
    fn no_signals_is_none_not_error() {
        assert_eq!(
            extract(b"<html><body>nothing</body></html>", SignalPriority::default()),
            None
        );
    }

    #[test]
    fn normalizes_entities_and_fullwidth_punctuation() {
        let url = normalize_candidate("https：／／ex.com／path&amp;more?x=1").expect("url");
        assert_eq!(url.as_str(), "https://ex.com/path&more");
    }

    #[test]
    fn rejects_hostless_and_unparseable() {
        assert_eq!(normalize_candidate("https://"), None);
        assert_eq!(normalize_candidate("http://exa mple.com"), None);
        assert_eq!(normalize_candidate("javascript:alert(1)"), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = extract(BOTH, SignalPriority::CanonicalFirst);
        let second = extract(BOTH, SignalPriority::CanonicalFirst);
        assert_eq!(first, second);
    }
}
