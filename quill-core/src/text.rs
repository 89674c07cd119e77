//! Small string helpers shared by partial accept and narrowing.
//!
//! All offsets are byte offsets on char boundaries; nothing here slices
//! through a multi-byte character.

/// Split a suggestion into its next word and whatever follows.
///
/// The token keeps any leading whitespace, the word itself and the whole
/// whitespace run after it, so inserting tokens one by one reproduces the
/// suggestion exactly. The remainder is empty when nothing but the token
/// is left.
pub fn extract_next_word_and_remaining(suggestion: &str) -> (&str, &str) {
    let word_start = suggestion
        .find(|c: char| !c.is_whitespace())
        .unwrap_or(suggestion.len());
    let rest = &suggestion[word_start..];

    let Some(gap_start) = rest.find(char::is_whitespace) else {
        return (suggestion, "");
    };
    let gap_end = rest[gap_start..]
        .find(|c: char| !c.is_whitespace())
        .map_or(rest.len(), |offset| gap_start + offset);

    suggestion.split_at(word_start + gap_end)
}

/// Case-insensitive `str::strip_prefix`.
pub fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = text.char_indices();
    for expected in prefix.chars() {
        let (_, actual) = chars.next()?;
        if !chars_eq_ci(actual, expected) {
            return None;
        }
    }
    Some(chars.as_str())
}

/// Case-insensitive `str::strip_suffix`.
pub fn strip_suffix_ci<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let mut end = text.len();
    let mut chars = text.char_indices().rev();
    for expected in suffix.chars().rev() {
        let (idx, actual) = chars.next()?;
        if !chars_eq_ci(actual, expected) {
            return None;
        }
        end = idx;
    }
    Some(&text[..end])
}

fn chars_eq_ci(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Byte offsets of every char boundary in `text`, excluding `text.len()`.
pub fn char_boundaries(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.char_indices().map(|(idx, _)| idx)
}
