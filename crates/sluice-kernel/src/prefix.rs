//! Session folder-prefix scoping.
//!
//! A connection can be confined to a sub-tree of the user's virtual
//! filesystem: the client sees `/files/report.csv` while the core works on
//! `/report.csv`. Paths outside the prefix are reported as non-existent.

use crate::vfs::path::{clean_path, is_within};

/// Maps a session's folder prefix onto and off client-visible paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathVirtualizer {
    prefix: String,
}

impl PathVirtualizer {
    /// A virtualizer scoped to `prefix` (empty for no scoping).
    pub fn new(prefix: &str) -> Self {
        let mut v = Self::default();
        v.set_prefix(prefix);
        v
    }

    /// Normalize and store the prefix: `files`, `/files/` and `files/` all
    /// become `/files`. An empty prefix disables scoping.
    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = if prefix.trim().is_empty() {
            String::new()
        } else {
            clean_path(prefix)
        };
    }

    /// The normalized prefix, empty when unset.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn is_unscoped(&self) -> bool {
        self.prefix.is_empty() || self.prefix == "/"
    }

    /// True if `path` is the prefix itself or lies below it.
    ///
    /// Matching is segment-wise: `/files1` is not inside `/files`.
    pub fn contains_prefix(&self, path: &str) -> bool {
        if self.is_unscoped() {
            return true;
        }
        is_within(&clean_path(path), &self.prefix)
    }

    /// Remove the prefix from `path`.
    ///
    /// Returns the remainder (`/` when nothing is left) and whether the
    /// prefix was present. Without a prefix this is a no-op that reports
    /// success.
    pub fn strip_prefix(&self, path: &str) -> (String, bool) {
        if self.is_unscoped() {
            return (path.to_string(), true);
        }
        let cleaned = clean_path(path);
        if !is_within(&cleaned, &self.prefix) {
            return (path.to_string(), false);
        }
        let rest = &cleaned[self.prefix.len()..];
        if rest.is_empty() {
            ("/".to_string(), true)
        } else {
            (rest.to_string(), true)
        }
    }

    /// Put the prefix back in front of a core-side virtual path.
    pub fn apply_prefix(&self, virtual_path: &str) -> String {
        if self.is_unscoped() {
            return clean_path(virtual_path);
        }
        clean_path(&format!("{}/{}", self.prefix, virtual_path))
    }

    /// When `path` is a strict ancestor of the prefix, the next segment on
    /// the way down to it.
    ///
    /// Listing `/` under prefix `/data/files` yields `data`; listing `/data`
    /// yields `files`. This lets a client navigate into the scoped root
    /// without seeing siblings.
    pub fn ancestor_entry(&self, path: &str) -> Option<String> {
        if self.is_unscoped() {
            return None;
        }
        let cleaned = clean_path(path);
        if cleaned == self.prefix || !is_within(&self.prefix, &cleaned) {
            return None;
        }
        let rest = if cleaned == "/" {
            &self.prefix[1..]
        } else {
            &self.prefix[cleaned.len() + 1..]
        };
        rest.split('/').next().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_prefix_normalizes() {
        let mut v = PathVirtualizer::default();
        for p in ["files", "/files/", "files/"] {
            v.set_prefix(p);
            assert_eq!(v.prefix(), "/files");
        }
    }

    #[test]
    fn test_contains_prefix() {
        let v = PathVirtualizer::new("/files");
        assert!(v.contains_prefix("/files"));
        assert!(v.contains_prefix("/files/test.csv"));
        assert!(v.contains_prefix("files"));
        assert!(v.contains_prefix("files/test.csv"));

        assert!(!v.contains_prefix("/files1"));
        assert!(!v.contains_prefix("/files1/test.csv"));
        assert!(!v.contains_prefix("files1/"));
        assert!(!v.contains_prefix("files1/test.csv"));
    }

    #[test]
    fn test_contains_prefix_no_prefix() {
        let v = PathVirtualizer::default();
        for p in ["/files", "/files/test.csv", "files", "/files1", "files1/test.csv"] {
            assert!(v.contains_prefix(p));
        }
        let root = PathVirtualizer::new("/");
        assert!(root.contains_prefix("/anything"));
    }

    #[test]
    fn test_strip_prefix() {
        let v = PathVirtualizer::new("files");
        assert_eq!(v.strip_prefix("/files"), ("/".to_string(), true));
        assert_eq!(v.strip_prefix("/files/a/b.txt"), ("/a/b.txt".to_string(), true));
        assert_eq!(v.strip_prefix("/files1"), ("/files1".to_string(), false));
    }

    #[test]
    fn test_strip_prefix_no_prefix() {
        let v = PathVirtualizer::default();
        assert_eq!(v.strip_prefix("/files1"), ("/files1".to_string(), true));
    }

    #[test]
    fn test_apply_prefix() {
        let v = PathVirtualizer::new("/files");
        assert_eq!(v.apply_prefix("/"), "/files");
        assert_eq!(v.apply_prefix("/a.txt"), "/files/a.txt");
        assert_eq!(PathVirtualizer::default().apply_prefix("/a.txt"), "/a.txt");
    }

    #[test]
    fn test_ancestor_entry() {
        let v = PathVirtualizer::new("/data/files");
        assert_eq!(v.ancestor_entry("/").as_deref(), Some("data"));
        assert_eq!(v.ancestor_entry("/data").as_deref(), Some("files"));
        assert_eq!(v.ancestor_entry("/data/files"), None);
        assert_eq!(v.ancestor_entry("/other"), None);
        assert_eq!(v.ancestor_entry("/dat"), None);
        assert_eq!(PathVirtualizer::default().ancestor_entry("/"), None);
    }
}
