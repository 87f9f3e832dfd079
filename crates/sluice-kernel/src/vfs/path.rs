//! Slash-separated virtual path helpers.
//!
//! Virtual paths are always absolute and use `/` regardless of the host
//! platform; these helpers never touch the real filesystem.

/// Normalize to an absolute path: collapse `//`, drop `.`, resolve `..`
/// lexically (never above `/`) and strip any trailing slash.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Join two path fragments and clean the result.
pub fn join(base: &str, rest: &str) -> String {
    clean_path(&format!("{base}/{rest}"))
}

/// Parent directory of a cleaned path; `/` is its own parent.
pub fn parent(path: &str) -> String {
    let cleaned = clean_path(path);
    match cleaned.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

/// Last path segment, or `/` for the root.
pub fn file_name(path: &str) -> String {
    let cleaned = clean_path(path);
    if cleaned == "/" {
        return cleaned;
    }
    cleaned
        .rsplit('/')
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| "/".to_string())
}

/// Returns true if `path` equals `dir` or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// `path` and each of its ancestors, most specific first, ending at `/`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut current = clean_path(path);
    let mut out = vec![current.clone()];
    while current != "/" {
        current = parent(&current);
        out.push(current.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("."), "/");
        assert_eq!(clean_path("files"), "/files");
        assert_eq!(clean_path("/files/"), "/files");
        assert_eq!(clean_path("//a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/../../etc"), "/etc");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b/c.txt"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("/"), "/");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/files", "/files"));
        assert!(is_within("/files/a", "/files"));
        assert!(!is_within("/files1", "/files"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b"), vec!["/a/b", "/a", "/"]);
        assert_eq!(ancestors("/"), vec!["/"]);
    }
}
