//! Minimal XML helpers for the recorder's flat, fixed-shape documents.
//!
//! The device firmware's parser is strict about what it receives but its own
//! responses are simple: plain tags, attributes only on the root element.
//! Scanning for matching tags keeps us byte-compatible without pulling a
//! full XML stack into the client.

/// Returns the text content of the first `<tag>...</tag>` element.
pub(crate) fn text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let close = format!("</{}>", tag);
    let open_at = find_open_tag(body, tag)?;
    let rest = &body[open_at..];
    let end = rest.find(&close)?;
    Some(rest[..end].trim())
}

/// Returns the inner content of every `<tag>...</tag>` element, in order.
pub(crate) fn blocks<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = find_open_tag(rest, tag) {
        let inner = &rest[start..];
        let Some(end) = inner.find(&close) else {
            break;
        };
        out.push(&inner[..end]);
        rest = &inner[end + close.len()..];
    }
    out
}

/// Position just past the `>` of the first opening `<tag>` or `<tag attr..>`.
fn find_open_tag(body: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{}", tag);
    let mut from = 0;
    while let Some(pos) = body[from..].find(&needle) {
        let at = from + pos + needle.len();
        match body[at..].chars().next() {
            Some('>') => return Some(at + 1),
            Some(c) if c.is_whitespace() => {
                let gt = body[at..].find('>')?;
                return Some(at + gt + 1);
            }
            // Prefix of a longer tag name, keep scanning.
            _ => from = at,
        }
    }
    None
}

/// Escapes `&` for embedding a raw URI in an XML body, as the device expects.
pub(crate) fn escape_amp(s: &str) -> String {
    s.replace('&', "&amp;")
}

pub(crate) fn unescape_amp(s: &str) -> String {
    s.replace("&amp;", "&")
}
