//! Path parsing.
//!
//! Paths are `/`-separated byte strings. Parsing never mutates the input;
//! [`skip_elem`] peels one component off the front and the caller loops.

use crate::param::NAME_MAX;

/// Splits the first path element off `path`.
///
/// Returns `Some((name, rest))` where `name` is the leading component and
/// `rest` is the remainder with its leading slashes removed, so the caller
/// can check `rest.is_empty()` to see whether `name` was the last one.
/// Returns `None` when no component remains.
///
/// ```text
/// skip_elem(b"a/bb/c")   == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")        == Some((b"a", b""))
/// skip_elem(b"")         == None
/// skip_elem(b"////")     == None
/// ```
pub fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];

    let len = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let name = &path[..len];

    let rest = &path[len..];
    let next = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    Some((name, &rest[next..]))
}

/// True if `path` names the containing directory once trailing slashes are
/// stripped: `""`, `"/"`, `"///"`.
pub fn is_bare(path: &[u8]) -> bool {
    path.iter().all(|&c| c == b'/')
}

/// Strips at most one trailing `/` (`"a/b/"` means the directory `a/b`).
pub fn strip_trailing_slash(path: &[u8]) -> &[u8] {
    match path.split_last() {
        Some((b'/', rest)) => rest,
        _ => path,
    }
}

/// True if `name` can be stored in a directory entry: nonempty and at most
/// `NAME_MAX` bytes.
pub fn valid_name(name: &[u8]) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_elem_works() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"///a//"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"////"), None);
    }

    #[test]
    fn trailing_slash_and_bare() {
        assert_eq!(strip_trailing_slash(b"a/b/"), b"a/b");
        assert_eq!(strip_trailing_slash(b"a/b"), b"a/b");
        assert!(is_bare(b""));
        assert!(is_bare(b"/"));
        assert!(is_bare(b"///"));
        assert!(!is_bare(b"/a"));
    }

    #[test]
    fn name_bounds() {
        assert!(valid_name(b"x"));
        assert!(valid_name(b"12345678901234"));
        assert!(!valid_name(b"123456789012345"));
        assert!(!valid_name(b""));
    }
}
