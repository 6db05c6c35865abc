//! URL decoding and path canonicalization.
//!
//! Request paths are percent-decoded, stripped of their root `/` and then
//! normalized: repeated separators collapse, `.` segments disappear and `..`
//! segments consume the segment before them. Anything that still points at
//! the filesystem root or above the document root afterwards is rejected.

use thiserror::Error;

/// Rejected request paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path does not start with '/'")]
    NotAbsolute,

    #[error("path escapes the document root: {0}")]
    Traversal(String),
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%XX` escapes. Malformed escapes are copied through unchanged;
/// invalid UTF-8 in the result is replaced.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Normalizes `.`/`..` segments and repeated separators.
///
/// A leading `/` and a trailing `/` are kept; an empty result becomes `.`.
/// `..` segments that cannot be resolved stay at the front. Applying this to
/// its own output returns the output unchanged.
pub fn normalize(path: &str) -> String {
    let rooted = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let mut out = String::with_capacity(path.len());
    if rooted {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() && segments.last() != Some(&"..") {
        out.push('/');
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Canonicalizes a decoded request path such as `/a/b/../c` into the
/// root-relative form `a/c`.
///
/// Fails if the request path is not rooted, if the root-relative remainder
/// is itself rooted (`//x`), or if it climbs above the root (`/../x`).
pub fn canonicalize_path(request_path: &str) -> Result<String, PathError> {
    let relative = request_path
        .strip_prefix('/')
        .ok_or(PathError::NotAbsolute)?;
    canonicalize_relative(relative)
}

/// Canonicalizes a root-relative path, rejecting escapes. Used where the
/// caller has already dropped the root separator.
pub fn canonicalize_relative(path: &str) -> Result<String, PathError> {
    let canonical = normalize(path);
    if canonical.starts_with('/') || canonical == ".." || canonical.starts_with("../") {
        return Err(PathError::Traversal(canonical));
    }
    Ok(canonical)
}

/// True if any component of a canonical path is hidden (starts with `.`).
/// The bare `.` path is not hidden.
pub fn has_hidden_component(canonical: &str) -> bool {
    canonical != "." && canonical.split('/').any(|seg| seg.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("/a%20b"), "/a b");
        assert_eq!(percent_decode("%2Fetc"), "/etc");
        assert_eq!(percent_decode("%41%62"), "Ab");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz%4"), "%zz%4");
    }

    #[test]
    fn test_canonicalize_dotdot() {
        assert_eq!(canonicalize_path("/a/b/../c").unwrap(), "a/c");
        assert_eq!(canonicalize_path("/a/b/..").unwrap(), "a");
        assert_eq!(canonicalize_path("/a/..").unwrap(), ".");
    }

    #[test]
    fn test_canonicalize_separators_and_dots() {
        assert_eq!(canonicalize_path("/a//b///c").unwrap(), "a/b/c");
        assert_eq!(canonicalize_path("/./a/./b").unwrap(), "a/b");
        assert_eq!(canonicalize_path("/cpu/").unwrap(), "cpu/");
        assert_eq!(canonicalize_path("/").unwrap(), ".");
    }

    #[test]
    fn test_canonicalize_rejects_traversal() {
        assert!(matches!(
            canonicalize_relative("../x"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            canonicalize_relative("/x"),
            Err(PathError::Traversal(_))
        ));
        assert!(canonicalize_path("/../x").is_err());
        assert!(canonicalize_path("/a/../../x").is_err());
        assert!(canonicalize_path("/..").is_err());
        assert!(canonicalize_path("//x").is_err());
        assert_eq!(canonicalize_path("x"), Err(PathError::NotAbsolute));
    }

    #[test]
    fn test_normalize_idempotent() {
        for p in [
            "a/c", ".", "x/y/", "/abs", "../up", "a/b/c", "a//b/./../c/", "/../..",
        ] {
            let once = normalize(p);
            assert_eq!(normalize(&once), once, "input {p}");
        }
    }

    #[test]
    fn test_canonical_path_unchanged() {
        for p in ["smver", "cpu", "a/b/c", "."] {
            assert_eq!(canonicalize_relative(p).unwrap(), p);
        }
    }

    #[test]
    fn test_hidden_component() {
        assert!(has_hidden_component(".git"));
        assert!(has_hidden_component("a/.env"));
        assert!(!has_hidden_component("."));
        assert!(!has_hidden_component("a/b"));
    }
}
