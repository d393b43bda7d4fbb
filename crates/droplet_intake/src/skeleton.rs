//! Creates the directories a file needs before it can be written inside the sandbox.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::path_guard::{EscapeError, PathGuard};

/// An error returned by [`create_skeleton`].
#[derive(Debug, thiserror::Error)]
pub enum SkeletonError {
    #[error(transparent)]
    Escape(#[from] EscapeError),

    /// The path resolves to the sandbox root itself, which can never be a file.
    #[error("'{}' does not name a file inside the sandbox", .0.display())]
    EmptyPath(PathBuf),

    /// Something other than a directory occupies one of the ancestors.
    #[error("'{}' exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to create directory '{}'", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ensures every ancestor directory of `relative` exists inside the sandbox and returns the
/// resolved absolute path of `relative` itself. Nothing is created at that final path.
///
/// The whole path is resolved through the [`PathGuard`] before the first directory is created, so
/// a path that escapes the sandbox fails without side effects. Calling this again with the same
/// path is a no-op.
pub fn create_skeleton(guard: &PathGuard, relative: &Path) -> Result<PathBuf, SkeletonError> {
    let destination = guard.resolve(relative)?;
    if destination.as_path() == guard.root() {
        return Err(SkeletonError::EmptyPath(relative.to_path_buf()));
    }

    let Some(ancestors) = destination
        .parent()
        .and_then(|parent| parent.strip_prefix(guard.root()).ok())
    else {
        return Ok(destination);
    };

    let mut current = guard.root().to_path_buf();
    for component in ancestors.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(SkeletonError::NotADirectory(current)),
            Err(err) if err.kind() == ErrorKind::NotFound => create_directory(&current)?,
            Err(err) if err.kind() == ErrorKind::NotADirectory => {
                return Err(SkeletonError::NotADirectory(current))
            }
            Err(source) => {
                return Err(SkeletonError::CreateDirectory {
                    path: current,
                    source,
                })
            }
        }
    }

    Ok(destination)
}

fn create_directory(path: &Path) -> Result<(), SkeletonError> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        // Another writer created it in the meantime.
        Err(err) if err.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(source) => Err(SkeletonError::CreateDirectory {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use walkdir::WalkDir;

    fn sandbox() -> (tempfile::TempDir, PathGuard) {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("sandbox");
        std::fs::create_dir(&root).unwrap();
        let guard = PathGuard::new(&root).unwrap();
        (temp_dir, guard)
    }

    fn tree(path: &Path) -> Vec<PathBuf> {
        WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| entry.unwrap().into_path())
            .collect()
    }

    #[test]
    fn test_creates_ancestors_but_not_the_file() {
        let (_temp_dir, guard) = sandbox();
        let destination = create_skeleton(&guard, Path::new("a/b/c/file.txt")).unwrap();

        assert_eq!(destination, guard.root().join("a/b/c/file.txt"));
        assert!(guard.root().join("a/b/c").is_dir());
        assert!(!destination.exists());
    }

    #[test]
    fn test_is_idempotent() {
        let (_temp_dir, guard) = sandbox();
        let first = create_skeleton(&guard, Path::new("a/b/file.txt")).unwrap();
        let before = tree(guard.root());
        let second = create_skeleton(&guard, Path::new("a/b/file.txt")).unwrap();

        assert_eq!(first, second);
        assert_eq!(before, tree(guard.root()));
        assert!(!second.exists());
    }

    #[test]
    fn test_top_level_file_needs_no_directories() {
        let (_temp_dir, guard) = sandbox();
        let destination = create_skeleton(&guard, Path::new("index.php")).unwrap();
        assert_eq!(destination, guard.root().join("index.php"));
        assert_eq!(tree(guard.root()), vec![guard.root().to_path_buf()]);
    }

    #[test]
    fn test_escape_creates_nothing() {
        let (temp_dir, guard) = sandbox();
        let before = tree(temp_dir.path());

        assert_matches!(
            create_skeleton(&guard, Path::new("a/b/../../../outside/file.txt")),
            Err(SkeletonError::Escape(EscapeError::OutsideSandbox { .. }))
        );
        assert_matches!(
            create_skeleton(&guard, Path::new("../outside/file.txt")),
            Err(SkeletonError::Escape(EscapeError::OutsideSandbox { .. }))
        );
        assert_eq!(before, tree(temp_dir.path()));
    }

    #[test]
    fn test_file_in_the_way() {
        let (_temp_dir, guard) = sandbox();
        std::fs::write(guard.root().join("a"), "not a directory").unwrap();

        assert_matches!(
            create_skeleton(&guard, Path::new("a/b/file.txt")),
            Err(SkeletonError::NotADirectory(path)) if path == guard.root().join("a")
        );
        assert_eq!(
            std::fs::read_to_string(guard.root().join("a")).unwrap(),
            "not a directory"
        );
    }

    #[test]
    fn test_root_is_not_a_file() {
        let (_temp_dir, guard) = sandbox();
        assert_matches!(
            create_skeleton(&guard, Path::new(".")),
            Err(SkeletonError::EmptyPath(_))
        );
        assert_matches!(
            create_skeleton(&guard, Path::new("a/..")),
            Err(SkeletonError::EmptyPath(_))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_ancestor_outside_is_rejected() {
        let (temp_dir, guard) = sandbox();
        let outside = temp_dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, guard.root().join("vendor")).unwrap();

        assert_matches!(
            create_skeleton(&guard, Path::new("vendor/pkg/file.txt")),
            Err(SkeletonError::Escape(_))
        );
        assert!(!outside.join("pkg").exists());
    }
}
