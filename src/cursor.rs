//! Opaque pagination cursors.
//!
//! A cursor is the `(created_at, path)` sort key of the last item on a page,
//! serialized as `"<RFC3339 timestamp>|<path>"` and base64url-encoded.  The
//! split on decode happens at the *first* `|`, since timestamps never contain
//! one but paths may.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Decoded pagination position.
///
/// The default value (epoch, empty path) is the "zero cursor" and means
/// "start from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub path: String,
}

impl Cursor {
    /// `true` for the start-of-list cursor produced by decoding `""`.
    pub fn is_zero(&self) -> bool {
        self.path.is_empty()
    }
}

/// Reasons a cursor string can fail to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("decode cursor: invalid encoding")]
    InvalidEncoding,

    #[error("decode cursor: invalid format")]
    InvalidFormat,

    #[error("decode cursor: empty path")]
    EmptyPath,

    #[error("decode cursor: invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Format a timestamp the way it is stored and embedded in cursors.
///
/// Always nine fractional digits, so lexical order equals time order.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp written by [`format_timestamp`] (any RFC 3339 value is
/// accepted).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// Encode a `(created_at, path)` pair into an opaque cursor string.
pub fn encode_cursor(created_at: &DateTime<Utc>, path: &str) -> String {
    let raw = format!("{}|{}", format_timestamp(created_at), path);
    URL_SAFE.encode(raw.as_bytes())
}

/// Decode a cursor string.  An empty string yields the zero cursor.
pub fn decode_cursor(cursor: &str) -> Result<Cursor, CursorError> {
    if cursor.is_empty() {
        return Ok(Cursor::default());
    }

    let decoded = URL_SAFE
        .decode(cursor.as_bytes())
        .map_err(|_| CursorError::InvalidEncoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| CursorError::InvalidEncoding)?;

    let (timestamp, path) = decoded.split_once('|').ok_or(CursorError::InvalidFormat)?;

    if path.is_empty() {
        return Err(CursorError::EmptyPath);
    }

    let created_at =
        parse_timestamp(timestamp).map_err(|e| CursorError::InvalidTimestamp(e.to_string()))?;

    Ok(Cursor {
        created_at,
        path: path.to_string(),
    })
}

/// Escape `\`, `%` and `_` so user input can be used as a literal prefix in
/// `LIKE ? || '%' ESCAPE '\'`.
///
/// Backslash goes first; otherwise the escapes added for `%` and `_` would be
/// escaped again.
pub fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ── Tests ───────────────────────────────────────────────────────────
