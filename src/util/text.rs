use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// Maximum stored length of an article description, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 50_000;

static TAG_RE: OnceLock<Regex> = OnceLock::new();
static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();

fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"))
}

fn whitespace_re() -> &'static Regex {
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Reduces an HTML fragment to plain text for storage.
///
/// Each pass decodes entities, removes tags, collapses whitespace runs to a
/// single space and trims. Passes repeat until the text stops changing, so
/// markup hidden behind an encoded entity (`&lt;b&gt;`) or a double-encoded
/// one (`&amp;lt;b&amp;gt;`) is still removed.
///
/// The result is a fixed point: `strip_html(&strip_html(x)) == strip_html(x)`.
/// The loop terminates because a pass that changes the text either shortens
/// it or turns other whitespace into plain spaces, which the next pass keeps.
///
/// # Examples
///
/// ```
/// use briefed::util::strip_html;
///
/// assert_eq!(strip_html("<p>A &amp; B<br></p>"), "A & B");
/// assert_eq!(strip_html("&lt;script&gt;alert(1)&lt;/script&gt; ok"), "alert(1) ok");
/// ```
pub fn strip_html(input: &str) -> String {
    let mut current = input.to_string();

    loop {
        let decoded = html_escape::decode_html_entities(&current);
        let stripped = tag_re().replace_all(&decoded, "");
        let collapsed = whitespace_re().replace_all(&stripped, " ");
        let next = collapsed.trim();
        if next == current {
            return current;
        }
        current = next.to_string();
    }
}

/// Truncates `s` to at most `max_chars` characters.
///
/// Counts Unicode scalar values, not bytes, so multi-byte text is never
/// split mid-character. Returns `Cow::Borrowed` when no truncation is needed.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(s[..byte_idx].to_string()),
        None => Cow::Borrowed(s),
    }
}

/// First `max_chars` characters of a possibly binary body, for diagnostics.
pub fn snippet(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    truncate_chars(text.trim(), max_chars).into_owned()
}
