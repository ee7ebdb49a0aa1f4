//! Path canonicalization.
//!
//! Graph entries are keyed by path, so every path that enters the store
//! (declared outputs, reported dependencies) goes through here first.

use std::path::Path;

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar".
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();
    // Leading ".." components that could not be popped.
    let mut ups = 0;
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() && !absolute {
                    ups += 1;
                }
            }
            _ => components.push(part),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..ups {
        out.push_str("../");
    }
    out.push_str(&components.join("/"));
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Canonicalize a dependency path reported from a command that ran in
/// `folder` (relative to the build root `root`).  Paths that stay inside
/// the build root come back relative to it; anything else comes back
/// absolute.
pub fn canon_dep_path(root: &Path, folder: Option<&str>, dep: &str) -> String {
    if Path::new(dep).is_absolute() {
        return canon_path(dep);
    }
    let joined = match folder {
        Some(folder) if !folder.is_empty() => format!("{}/{}", folder, dep),
        _ => dep.to_string(),
    };
    let rel = canon_path(&joined);
    if rel.starts_with("../") || rel == ".." {
        let abs = root.join(&rel);
        return canon_path(&abs.to_string_lossy());
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop() {
        assert_eq!(canon_path("foo"), "foo");
        assert_eq!(canon_path("foo/bar"), "foo/bar");
    }

    #[test]
    fn dot() {
        assert_eq!(canon_path("./foo"), "foo");
        assert_eq!(canon_path("foo/."), "foo");
        assert_eq!(canon_path("foo/./bar"), "foo/bar");
        assert_eq!(canon_path("."), ".");
    }

    #[test]
    fn slash() {
        assert_eq!(canon_path("/foo"), "/foo");
        assert_eq!(canon_path("foo//bar"), "foo/bar");
        assert_eq!(canon_path("/"), "/");
    }

    #[test]
    fn parent() {
        assert_eq!(canon_path("foo/../bar"), "bar");
        assert_eq!(canon_path("/foo/../bar"), "/bar");
        assert_eq!(canon_path("/../bar"), "/bar");
        assert_eq!(canon_path("../foo"), "../foo");
        assert_eq!(canon_path("../foo/../bar"), "../bar");
        assert_eq!(canon_path("../../bar"), "../../bar");
    }

    #[test]
    fn dep_paths() {
        let root = Path::new("/build");
        assert_eq!(canon_dep_path(root, Some("obj"), "gen/x.h"), "obj/gen/x.h");
        assert_eq!(canon_dep_path(root, Some("obj"), "../x.h"), "x.h");
        assert_eq!(canon_dep_path(root, None, "../src/x.h"), "/src/x.h");
        assert_eq!(canon_dep_path(root, Some("obj"), "/usr/include//stdio.h"), "/usr/include/stdio.h");
    }
}
