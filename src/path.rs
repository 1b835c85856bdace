//! Object path validation.
//!
//! Every path-accepting entry point (create, get, delete) runs the key
//! through [`is_valid_path`] before touching the repository or the storage
//! backend.  It is the only guard against traversal out of the storage root.

/// Characters that are never allowed anywhere in a path.
const FORBIDDEN_CHARS: &[char] = &['\\', '?', '#', '~'];

/// Return `true` if `p` is an acceptable storage key.
///
/// A valid path is relative, non-empty, has no empty or `.`/`..` segments,
/// and contains no control characters, DEL, whitespace, or any of
/// `\ ? # ~`.  Non-ASCII segments and a literal `%` are accepted.
///
/// `&str` is UTF-8 by construction; callers holding raw bytes should go
/// through [`is_valid_path_bytes`].
pub fn is_valid_path(p: &str) -> bool {
    if p.is_empty() || p == "/" || p == "." {
        return false;
    }

    if p.starts_with('/') || p.ends_with('/') {
        return false;
    }

    if p.contains("..") || p.contains("//") {
        return false;
    }

    if p.contains(FORBIDDEN_CHARS) {
        return false;
    }

    if p.starts_with("./") || p.contains("/./") || p.ends_with("/.") {
        return false;
    }

    !p.chars()
        .any(|c| c == '\0' || (c as u32) < 0x20 || c == '\u{7f}' || c.is_whitespace())
}

/// Byte-level variant of [`is_valid_path`]; invalid UTF-8 is rejected.
pub fn is_valid_path_bytes(p: &[u8]) -> bool {
    match std::str::from_utf8(p) {
        Ok(s) => is_valid_path(s),
        Err(_) => false,
    }
}

/// Return `true` if `name` can be spliced into SQL as a table identifier.
///
/// Matches `^[a-z_][a-z0-9_]*$` with a maximum length of 63 (the Postgres
/// identifier limit).
pub fn is_valid_table_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    first_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        for p in [
            "file.txt",
            "valid/path.txt",
            "a/b/c/d.json",
            "images/photo-01_final.jpg",
            "café/menü.txt",
            "日本語/ファイル.txt",
            "100%/done",
            ".hidden",
            "dir/.hidden",
            "a.b.c",
        ] {
            assert!(is_valid_path(p), "expected valid: {p:?}");
        }
    }

    #[test]
    fn test_rejects_empty_and_root() {
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("/"));
        assert!(!is_valid_path("."));
    }

    #[test]
    fn test_rejects_absolute_and_trailing_slash() {
        assert!(!is_valid_path("/etc/passwd"));
        assert!(!is_valid_path("dir/"));
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(!is_valid_path("../x"));
        assert!(!is_valid_path("a/../b"));
        assert!(!is_valid_path("a/.."));
        assert!(!is_valid_path("a..b"));
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(!is_valid_path("a//b"));
    }

    #[test]
    fn test_rejects_dot_segments() {
        assert!(!is_valid_path("a/./b"));
        assert!(!is_valid_path("./a"));
        assert!(!is_valid_path("a/."));
    }

    #[test]
    fn test_rejects_forbidden_chars() {
        for p in ["a\\b", "a?b", "a#b", "~user/file"] {
            assert!(!is_valid_path(p), "expected invalid: {p:?}");
        }
    }

    #[test]
    fn test_rejects_control_and_whitespace() {
        for p in [
            "a\0b",
            "a\nb",
            "a\tb",
            "a\u{1b}b",
            "a\u{7f}b",
            "a b",
            "a\u{a0}b",
            "a\u{3000}b",
        ] {
            assert!(!is_valid_path(p), "expected invalid: {p:?}");
        }
    }

    #[test]
    fn test_bytes_variant() {
        assert!(is_valid_path_bytes(b"ok/path.txt"));
        assert!(!is_valid_path_bytes(&[b'a', 0xff, b'b']));
        assert!(!is_valid_path_bytes(b""));
    }

    #[test]
    fn test_total_over_arbitrary_input() {
        // Every byte value in every position: must terminate without panicking.
        for b in 0u8..=255 {
            let bytes = [b'a', b, b'/', b, b'z'];
            let _ = is_valid_path_bytes(&bytes);
        }
    }

    #[test]
    fn test_table_names() {
        assert!(is_valid_table_name("stowry_metadata"));
        assert!(is_valid_table_name("_t1"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("1abc"));
        assert!(!is_valid_table_name("Meta"));
        assert!(!is_valid_table_name("meta-data"));
        assert!(!is_valid_table_name("meta; DROP TABLE x"));
        assert!(!is_valid_table_name(&"a".repeat(64)));
        assert!(is_valid_table_name(&"a".repeat(63)));
    }
}
