//! Full-width punctuation look-alikes.
//!
//! Capture tools substitute characters that are unsafe in filenames with
//! their full-width forms (`：` for `:`, `／` for `/`, ...). The same forms
//! leak into embedded URLs. Both places want the ASCII originals back.

use std::borrow::Cow;

const FULLWIDTH_OFFSET: u32 = 0xFEE0;
const IDEOGRAPHIC_SPACE: char = '\u{3000}';

/// Maps a full-width punctuation mark to ASCII. Full-width letters and digits
/// are ordinary title text and have no equivalent here.
pub fn ascii_equivalent(ch: char) -> Option<char> {
    if ch == IDEOGRAPHIC_SPACE {
        return Some(' ');
    }
    let ascii = char::from_u32((ch as u32).checked_sub(FULLWIDTH_OFFSET)?)?;
    ascii.is_ascii_punctuation().then_some(ascii)
}

/// Replaces every full-width look-alike in `input` with its ASCII form.
///
/// Borrows when nothing needs decoding, which is the common case.
pub fn decode(input: &str) -> Cow<'_, str> {
    if !input.chars().any(|ch| ascii_equivalent(ch).is_some()) {
        return Cow::Borrowed(input);
    }
    Cow::Owned(
        input
            .chars()
            .map(|ch| ascii_equivalent(ch).unwrap_or(ch))
            .collect(),
    )
}
