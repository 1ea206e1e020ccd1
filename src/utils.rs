// Path helpers shared by the queues and watchers.
//
// Remote paths are always '/'-separated strings regardless of platform, so these
// work on `&str` rather than `Path`.

pub fn join(dir: &str, name: &str) -> String {
    if name.is_empty() {
        return dir.to_string();
    }
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

pub fn join_all<'a>(dir: &str, segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .fold(dir.to_string(), |acc, segment| join(&acc, segment))
}

/// Parent directory of `path`; the root is its own parent.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None if path.starts_with('/') => "/".to_string(),
        None => String::new(),
    }
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// True when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    if ancestor.is_empty() {
        return path.starts_with('/') && path.len() > 1;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Drops every path that is nested under another selected path, keeping the
/// original order of what remains.
pub fn remove_nested(paths: &[String]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::with_capacity(paths.len());
    for path in paths {
        let covered = paths
            .iter()
            .any(|other| other != path && is_descendant(path, other));
        if !covered && !kept.contains(path) {
            kept.push(path.clone());
        }
    }
    kept
}

/// `report.pdf` + 2 -> `report (2).pdf`.
pub fn numbered_name(name: &str, n: usize) -> String {
    let (stem, ext) = split_extension(name);
    format!("{} ({}){}", stem, n, ext)
}

/// `report.pdf` + 1 -> `report copy.pdf`, + 3 -> `report copy 3.pdf`.
pub fn copy_name(name: &str, n: usize) -> String {
    let (stem, ext) = split_extension(name);
    if n <= 1 {
        format!("{} copy{}", stem, ext)
    } else {
        format!("{} copy {}{}", stem, n, ext)
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("/dst", "a"), "/dst/a");
        assert_eq!(join("/dst/", "a"), "/dst/a");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/dst", ""), "/dst");
        assert_eq!(join_all("/dst", ["sub", "deeper"]), "/dst/sub/deeper");
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent("/r/y/z"), "/r/y");
        assert_eq!(parent("/r"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("relative"), "");
        assert_eq!(basename("/r/y/z"), "z");
        assert_eq!(basename("/r/y/"), "y");
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/a/b", "/a"));
        assert!(is_descendant("/a/b/c", "/a/"));
        assert!(!is_descendant("/a", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(is_descendant("/a", "/"));
    }

    #[test]
    fn test_remove_nested() {
        let paths = vec![
            "/src/sub/b".to_string(),
            "/src".to_string(),
            "/other".to_string(),
            "/other".to_string(),
        ];
        assert_eq!(remove_nested(&paths), vec!["/src", "/other"]);
    }

    #[test]
    fn test_generated_names() {
        assert_eq!(numbered_name("report.pdf", 2), "report (2).pdf");
        assert_eq!(numbered_name("Makefile", 1), "Makefile (1)");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc (1)");
        assert_eq!(copy_name("report.pdf", 1), "report copy.pdf");
        assert_eq!(copy_name("photos", 3), "photos copy 3");
    }
}
