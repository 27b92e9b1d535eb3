//! Locate base64 image payloads embedded in captured HTML.
//!
//! Snapshots routinely reach tens of megabytes, most of it base64 text inside
//! `src="data:image/..."` attributes or CSS `url(...)` values. This crate finds
//! those payloads with a forward-only byte walk (marker search, delimiter
//! search, bounded character-class consumption) and never builds a DOM or runs
//! a document-wide regular expression. Anything that does not look exactly like
//! a base64 image data URI is left alone.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::Serialize;
use std::ops::Range;

const MARKER: &[u8] = b"data:image";
const BASE64_TOKEN: &[u8] = b"base64";
const SCHEME_LEN: usize = b"data:".len();
const MAX_MIME_LEN: usize = 64;
const MAX_PARAMS_LEN: usize = 128;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A base64 image payload found inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineResource<'a> {
    source: &'a [u8],
    marker_start: usize,
    mime: (usize, usize),
    payload: (usize, usize),
}

impl<'a> InlineResource<'a> {
    /// Offset of the `data:` scheme that opens the URI.
    pub fn marker_start(&self) -> usize {
        self.marker_start
    }

    /// Byte range of the encoded payload (after the comma).
    pub fn payload_range(&self) -> Range<usize> {
        self.payload.0..self.payload.1
    }

    /// Byte range from the `data:` scheme through the end of the payload.
    ///
    /// Replacing this range swaps the whole URI while leaving the surrounding
    /// quotes, parentheses or attribute syntax untouched.
    pub fn uri_range(&self) -> Range<usize> {
        self.marker_start..self.payload.1
    }

    /// Declared MIME type, as written (e.g. `image/png`).
    pub fn mime(&self) -> &'a str {
        std::str::from_utf8(&self.source[self.mime.0..self.mime.1]).unwrap_or("")
    }

    /// Lowercased MIME subtype (`png`, `svg+xml`, ...).
    pub fn mime_subtype(&self) -> String {
        self.mime()
            .split_once('/')
            .map(|(_, sub)| sub)
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// Encoded payload text, possibly wrapped with whitespace.
    pub fn encoded(&self) -> &'a [u8] {
        &self.source[self.payload.0..self.payload.1]
    }

    /// Decodes the payload into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_payload(self.encoded())
    }
}

/// Scanner states; each one consumes bytes from `cursor` forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FindMarker,
    ReadMime {
        marker: usize,
    },
    FindBase64 {
        marker: usize,
        mime_end: usize,
    },
    ConsumePayload {
        marker: usize,
        mime_end: usize,
        payload_start: usize,
    },
    Finished,
}

/// Iterator over the inline resources of a document, in document order.
pub struct Scanner<'a> {
    source: &'a [u8],
    cursor: usize,
    state: State,
}

/// Starts scanning `document` for base64 image payloads.
pub fn scan(document: &[u8]) -> Scanner<'_> {
    Scanner {
        source: document,
        cursor: 0,
        state: State::FindMarker,
    }
}

impl<'a> Scanner<'a> {
    /// Offset the next search resumes from.
    pub fn resume_offset(&self) -> usize {
        self.cursor
    }

    /// Abandons the current candidate and resumes after its marker.
    fn skip_candidate(&mut self, marker: usize) {
        self.cursor = marker + MARKER.len();
        self.state = State::FindMarker;
    }

    fn finish(&mut self) {
        self.cursor = self.source.len();
        self.state = State::Finished;
    }

    fn step(&mut self) -> Option<InlineResource<'a>> {
        let src = self.source;
        match self.state {
            State::FindMarker => match find_ascii_ci(src, MARKER, self.cursor) {
                Some(at) => {
                    self.cursor = at + MARKER.len();
                    self.state = State::ReadMime { marker: at };
                }
                None => self.finish(),
            },
            State::ReadMime { marker } => {
                let mime_start = marker + SCHEME_LEN;
                match src.get(self.cursor) {
                    None => {
                        self.finish();
                        return None;
                    }
                    Some(b'/') => {}
                    Some(_) => {
                        self.skip_candidate(marker);
                        return None;
                    }
                }
                let mut idx = self.cursor;
                loop {
                    let Some(&byte) = src.get(idx) else {
                        self.finish();
                        return None;
                    };
                    if byte == b';' {
                        break;
                    }
                    if !is_mime_byte(byte) || idx - mime_start >= MAX_MIME_LEN {
                        self.skip_candidate(marker);
                        return None;
                    }
                    idx += 1;
                }
                self.cursor = idx + 1;
                self.state = State::FindBase64 {
                    marker,
                    mime_end: idx,
                };
            }
            State::FindBase64 { marker, mime_end } => {
                let params_start = self.cursor;
                let mut idx = self.cursor;
                loop {
                    if idx >= src.len() {
                        self.finish();
                        return None;
                    }
                    if idx - params_start > MAX_PARAMS_LEN {
                        self.skip_candidate(marker);
                        return None;
                    }
                    if starts_with_ascii_ci(&src[idx..], BASE64_TOKEN) {
                        let after = idx + BASE64_TOKEN.len();
                        match src.get(after) {
                            None => {
                                self.finish();
                                return None;
                            }
                            Some(b',') => {
                                self.cursor = after + 1;
                                self.state = State::ConsumePayload {
                                    marker,
                                    mime_end,
                                    payload_start: after + 1,
                                };
                                return None;
                            }
                            Some(_) => {}
                        }
                    }
                    if !is_param_byte(src[idx]) {
                        self.skip_candidate(marker);
                        return None;
                    }
                    idx += 1;
                }
            }
            State::ConsumePayload {
                marker,
                mime_end,
                payload_start,
            } => {
                let Some(end) = payload_end(src, payload_start) else {
                    // No closing delimiter: the document is truncated mid-payload.
                    self.finish();
                    return None;
                };
                self.cursor = end;
                self.state = State::FindMarker;
                if end > payload_start {
                    return Some(InlineResource {
                        source: src,
                        marker_start: marker,
                        mime: (marker + SCHEME_LEN, mime_end),
                        payload: (payload_start, end),
                    });
                }
            }
            State::Finished => {}
        }
        None
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = InlineResource<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.state != State::Finished {
            if let Some(found) = self.step() {
                return Some(found);
            }
        }
        None
    }
}

/// Rebuilds `document`, asking `replace` for a substitute of every resource's
/// URI. Bytes between resources, and resources the closure declines, are
/// copied verbatim. Returns the new document and the number of substitutions.
pub fn splice<F>(document: &[u8], mut replace: F) -> (Vec<u8>, usize)
where
    F: FnMut(&InlineResource<'_>) -> Option<Vec<u8>>,
{
    let mut output = Vec::with_capacity(document.len());
    let mut copied_to = 0usize;
    let mut replaced = 0usize;
    for resource in scan(document) {
        if let Some(substitute) = replace(&resource) {
            let range = resource.uri_range();
            output.extend_from_slice(&document[copied_to..range.start]);
            output.extend_from_slice(&substitute);
            copied_to = range.end;
            replaced += 1;
        }
    }
    output.extend_from_slice(&document[copied_to..]);
    (output, replaced)
}

/// Decodes an encoded payload, ignoring embedded whitespace and padding errors.
pub fn decode_payload(encoded: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: Vec<u8> = encoded
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    PAYLOAD_ENGINE.decode(compact)
}

/// Encodes bytes as a padded, unwrapped base64 payload.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Builds a complete `data:` URI for `mime` and `bytes`.
pub fn data_uri(mime: &str, bytes: &[u8]) -> Vec<u8> {
    format!("data:{mime};base64,{}", encode_payload(bytes)).into_bytes()
}

/// Inventory entry emitted by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    /// Offset of the `data:` marker.
    pub offset: usize,
    /// Declared MIME type.
    pub mime: String,
    /// Length of the encoded payload in bytes.
    pub encoded_len: usize,
    /// Decoded size, or `None` when the payload is not valid base64.
    pub decoded_len: Option<usize>,
}

/// Summarizes every inline resource in `document`.
pub fn inventory(document: &[u8]) -> Vec<ResourceSummary> {
    scan(document)
        .map(|resource| ResourceSummary {
            offset: resource.marker_start(),
            mime: resource.mime().to_string(),
            encoded_len: resource.encoded().len(),
            decoded_len: resource.decode().ok().map(|bytes| bytes.len()),
        })
        .collect()
}

fn find_ascii_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    let first = needle.first()?.to_ascii_lowercase();
    let last_start = haystack.len().checked_sub(needle.len())?;
    let mut idx = from;
    while idx <= last_start {
        let offset = haystack[idx..=last_start]
            .iter()
            .position(|byte| byte.to_ascii_lowercase() == first)?;
        let at = idx + offset;
        if haystack[at..at + needle.len()].eq_ignore_ascii_case(needle) {
            return Some(at);
        }
        idx = at + 1;
    }
    None
}

fn starts_with_ascii_ci(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

fn is_mime_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'/' | b'+' | b'-' | b'.' | b'_')
}

fn is_param_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'=' | b';' | b'-' | b'.' | b'_' | b'+' | b'/')
}

fn is_base64_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')
}

/// Finds where the payload starting at `start` ends, or `None` when it runs
/// to the end of the document.
///
/// Whitespace only joins two segments of a line-wrapped payload: the run must
/// hold a line break, every segment so far must be whole quads with no `=`,
/// and what follows must not be a `srcset` descriptor. Anything else ends the
/// payload before the whitespace.
fn payload_end(src: &[u8], start: usize) -> Option<usize> {
    let mut idx = start;
    let mut quads_only = true;
    loop {
        let segment = idx;
        while idx < src.len() && is_base64_byte(src[idx]) {
            idx += 1;
        }
        if idx == src.len() {
            return None;
        }
        let body = &src[segment..idx];
        quads_only &= !body.is_empty() && body.len() % 4 == 0 && !body.contains(&b'=');

        let mut next = idx;
        let mut line_break = false;
        while next < src.len() && src[next].is_ascii_whitespace() {
            line_break |= matches!(src[next], b'\n' | b'\r');
            next += 1;
        }
        if next == src.len() {
            return None;
        }
        let continues = next > idx
            && line_break
            && quads_only
            && is_base64_byte(src[next])
            && !is_descriptor(&src[next..]);
        if !continues {
            return Some(idx);
        }
        idx = next;
    }
}

/// `2x`, `1.5x` or `480w`, terminated like a `srcset` candidate.
fn is_descriptor(rest: &[u8]) -> bool {
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let mut idx = digits;
    if rest.get(idx) == Some(&b'.') {
        let fraction = rest[idx + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if fraction == 0 {
            return false;
        }
        idx += 1 + fraction;
    }
    if !matches!(rest.get(idx), Some(b'w' | b'x')) {
        return false;
    }
    match rest.get(idx + 1) {
        None => true,
        Some(&byte) => matches!(byte, b',' | b'"' | b'\'' | b')') || byte.is_ascii_whitespace(),
    }
}
