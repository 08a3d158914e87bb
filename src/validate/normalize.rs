//! Pre-parse URL normalization.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;

/// Normalize a raw URL before any structural parsing.
///
/// Percent-decodes until the string stops changing, trims surrounding
/// whitespace, and collapses runs of slashes. A run directly after a `:` keeps
/// at most two slashes (`scheme://`); every other run becomes a single slash.
/// Case and trailing dots are left alone.
pub fn normalize(raw: &str) -> String {
    let decoded = decode_fully(raw);
    collapse_slashes(decoded.trim())
}

/// Each successful decode shrinks the string, so this terminates.
fn decode_fully(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = match percent_decode_str(&current).decode_utf8_lossy() {
            Cow::Borrowed(_) => return current,
            Cow::Owned(s) => s,
        };
        if next == current {
            return current;
        }
        current = next;
    }
}

fn collapse_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        if c != '/' {
            out.push(c);
            prev = Some(c);
            continue;
        }

        let mut run = 1;
        while chars.next_if_eq(&'/').is_some() {
            run += 1;
        }
        let keep = if prev == Some(':') { run.min(2) } else { 1 };
        out.extend(std::iter::repeat_n('/', keep));
        prev = Some('/');
    }
    out
}
