//! Path normalization and scope helpers.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, WatchError};

/// Normalizes a root-relative path to forward-slash form.
///
/// Backslashes become `/`, empty and `.` segments are dropped, leading and
/// trailing separators are stripped. `..` segments are rejected so a
/// normalized path can never leave the root. The root itself normalizes to
/// the empty string.
pub fn normalize_path(raw: &str) -> Result<String> {
    let replaced = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(WatchError::InvalidPath(format!(
                    "path escapes root: {raw}"
                )))
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Converts an absolute path under `root` into its normalized relative form.
///
/// Returns `None` for paths outside the root or the root itself.
pub fn relative_to_root(root: &Path, absolute: &Path) -> Option<String> {
    let relative = absolute.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Joins a normalized relative path onto the root.
pub fn join_root(root: &Path, normalized: &str) -> PathBuf {
    if normalized.is_empty() {
        return root.to_path_buf();
    }
    normalized
        .split('/')
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Checks if a path should be ignored.
pub fn path_is_ignored(ignored_roots: &[PathBuf], candidate: &Path) -> bool {
    ignored_roots
        .iter()
        .any(|ignored| candidate == ignored || candidate.starts_with(ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(normalize_path("notes\\daily\\today.md").unwrap(), "notes/daily/today.md");
        assert_eq!(normalize_path("/notes//./today.md/").unwrap(), "notes/today.md");
        assert_eq!(normalize_path("./a.md").unwrap(), "a.md");
    }

    #[test]
    fn root_normalizes_to_empty() {
        assert_eq!(normalize_path("").unwrap(), "");
        assert_eq!(normalize_path("/").unwrap(), "");
        assert_eq!(normalize_path("./").unwrap(), "");
    }

    #[test]
    fn parent_segments_rejected() {
        match normalize_path("notes/../../etc/passwd") {
            Err(WatchError::InvalidPath(_)) => {}
            other => panic!("expected invalid path, got {other:?}"),
        }
    }

    #[test]
    fn relative_to_root_strips_prefix() {
        let root = Path::new("/vault");
        assert_eq!(
            relative_to_root(root, Path::new("/vault/notes/a.md")),
            Some("notes/a.md".to_string())
        );
        assert_eq!(relative_to_root(root, Path::new("/vault")), None);
        assert_eq!(relative_to_root(root, Path::new("/other/a.md")), None);
    }

    #[test]
    fn join_root_round_trips_relative_path() {
        let root = Path::new("/vault");
        let joined = join_root(root, "notes/a.md");
        assert_eq!(joined, PathBuf::from("/vault/notes/a.md"));
        assert_eq!(relative_to_root(root, &joined), Some("notes/a.md".to_string()));
    }

    #[test]
    fn ignored_prefix_is_component_based() {
        let ignored = vec![PathBuf::from("/vault/.trash")];
        assert!(path_is_ignored(&ignored, Path::new("/vault/.trash")));
        assert!(path_is_ignored(&ignored, Path::new("/vault/.trash/a.md.0011aabb")));
        assert!(!path_is_ignored(&ignored, Path::new("/vault/.trashcan/a.md")));
    }
}
