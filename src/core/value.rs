//! Value records and the shared field escaping.
//!
//! A record is one `(text, priority, timestamp)` triple stored under a
//! setting. Records at the same priority are the same slot: a write replaces
//! the stored record only when its timestamp is strictly greater.

use super::{Priority, Timestamp};

/// Separates the fields of one encoded record.
pub const FIELD_SEPARATOR: char = '|';
/// Terminates one encoded record in a multi-record blob.
pub const RECORD_SEPARATOR: char = '\n';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueRecord {
    pub text: String,
    pub priority: Priority,
    pub timestamp: Timestamp,
}

impl ValueRecord {
    pub fn new(text: impl Into<String>, priority: Priority, timestamp: Timestamp) -> Self {
        Self {
            text: text.into(),
            priority,
            timestamp,
        }
    }
}

/// Escape a value so it survives the line-oriented encodings.
///
/// `\` becomes `\S`, the field separator `|` becomes `\P`, and line breaks
/// become `\n` / `\r`. The backslash rule makes the escaping reversible.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\S"),
            FIELD_SEPARATOR => out.push_str("\\P"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_text`]. Unknown escapes are kept verbatim.
pub fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('S') => out.push('\\'),
            Some('P') => out.push(FIELD_SEPARATOR),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Escape commas for the `all` reply, where values are comma-joined.
pub fn escape_commas(text: &str) -> String {
    text.replace(',', "\\,")
}
