//! Repository path handling
//!
//! All paths inside the engine are canonical: absolute, `/`-separated, no
//! trailing slash, no empty/`.`/`..` components. The root is `/`.

use crate::error::{FsError, Result};

/// Canonicalize a user-supplied path
pub fn canonicalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(invalid(path, "contains a NUL byte"));
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." {
            return Err(invalid(path, "'.' and '..' components are not allowed"));
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn invalid(path: &str, reason: &'static str) -> FsError {
    FsError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

pub fn is_root(path: &str) -> bool {
    path == "/"
}

/// Components of a canonical path; empty for the root
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

/// Split a canonical non-root path into (parent, basename)
pub fn split(path: &str) -> Option<(&str, &str)> {
    if is_root(path) {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Join a canonical directory path and a single name
pub fn join(dir: &str, name: &str) -> String {
    if is_root(dir) {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `ancestor` is `path` or one of its parent directories
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if is_root(ancestor) || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// True when one path contains the other
pub fn overlaps(a: &str, b: &str) -> bool {
    is_ancestor(a, b) || is_ancestor(b, a)
}

/// The part of `path` below `ancestor`, starting with `/`, or `""` when equal
pub fn suffix<'a>(ancestor: &str, path: &'a str) -> &'a str {
    if is_root(ancestor) {
        if is_root(path) { "" } else { path }
    } else {
        &path[ancestor.len()..]
    }
}

/// Re-root `path` from under `from` to under `to`
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    let rest = suffix(from, path);
    if rest.is_empty() {
        to.to_string()
    } else if is_root(to) {
        rest.to_string()
    } else {
        format!("{}{}", to, rest)
    }
}

/// Proper ancestors of a canonical path, nearest first, ending with `/`
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut cur = path;
    while let Some((parent, _)) = split(cur) {
        out.push(parent);
        cur = parent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("a/b").unwrap(), "/a/b");
        assert_eq!(canonicalize("//a///b/").unwrap(), "/a/b");
        assert!(canonicalize("/a/../b").is_err());
        assert!(canonicalize("/a/./b").is_err());
        assert!(canonicalize("/a\0b").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split("/"), None);
        assert_eq!(split("/a"), Some(("/", "a")));
        assert_eq!(split("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(components("/").count(), 0);
        assert_eq!(components("/a/b").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_ancestry() {
        assert!(is_ancestor("/", "/a"));
        assert!(is_ancestor("/a", "/a"));
        assert!(is_ancestor("/a", "/a/b"));
        assert!(!is_ancestor("/a", "/ab"));
        assert!(!is_ancestor("/a/b", "/a"));
        assert!(overlaps("/a/b", "/a"));
        assert!(!overlaps("/a/b", "/a/c"));
        assert_eq!(ancestors("/a/b/c"), vec!["/a/b", "/a", "/"]);
        assert!(ancestors("/").is_empty());
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("/d/sub/f", "/d", "/e"), "/e/sub/f");
        assert_eq!(rebase("/d", "/d", "/e/x"), "/e/x");
        assert_eq!(rebase("/a/b", "/", "/c"), "/c/a/b");
        assert_eq!(rebase("/c/a", "/c", "/"), "/a");
        assert_eq!(suffix("/d", "/d/f"), "/f");
        assert_eq!(suffix("/d", "/d"), "");
    }
}
