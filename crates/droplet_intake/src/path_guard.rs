//! Resolution of untrusted relative paths inside a sandbox directory.
//!
//! Paths supplied by clients (resource destinations, archive entry names, symlink targets) are
//! resolved against the sandbox root with every symlink along the way followed, and the result is
//! only accepted if it lands on or below the canonical root. Parts of the path that do not exist
//! yet are appended lexically after the deepest existing ancestor has been canonicalized.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// An error returned when a path cannot be confined to the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum EscapeError {
    /// Absolute paths are never accepted as sandbox relative paths.
    #[error("'{}' is an absolute path", .0.display())]
    AbsolutePath(PathBuf),

    /// The fully resolved path is not inside the sandbox.
    #[error("'{}' resolves to '{}' which is outside of '{}'", .path.display(), .resolved.display(), .root.display())]
    OutsideSandbox {
        path: PathBuf,
        resolved: PathBuf,
        root: PathBuf,
    },

    /// A component of the path exists but could not be canonicalized, for instance a dangling or
    /// looping symlink.
    #[error("'{}' could not be resolved", .path.display())]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Confines paths to a sandbox root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Constructs a guard for the existing directory `root`. The root is canonicalized once; all
    /// containment checks compare against the canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, EscapeError> {
        let root = root.as_ref();
        let root = dunce::canonicalize(root).map_err(|source| EscapeError::Unresolvable {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Returns the canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if the absolute, canonical `path` is the root or a descendant of it.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Resolves `relative` against the sandbox root.
    ///
    /// Every existing component is canonicalized, so a symlink anywhere along the path is
    /// followed before the next component is applied. Components that do not exist are appended
    /// as is. `..` is applied to the path resolved so far. Containment is judged on the final
    /// result: a path that leaves the root and comes back is accepted, a path that ends up
    /// outside is rejected.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf, EscapeError> {
        let relative = relative.as_ref();
        if relative.has_root() || relative.is_absolute() {
            return Err(EscapeError::AbsolutePath(relative.to_path_buf()));
        }

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(EscapeError::AbsolutePath(relative.to_path_buf()));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => {
                    let candidate = resolved.join(name);
                    resolved = match std::fs::symlink_metadata(&candidate) {
                        Ok(_) => dunce::canonicalize(&candidate).map_err(|source| {
                            EscapeError::Unresolvable {
                                path: relative.to_path_buf(),
                                source,
                            }
                        })?,
                        Err(err)
                            if matches!(
                                err.kind(),
                                ErrorKind::NotFound | ErrorKind::NotADirectory
                            ) =>
                        {
                            candidate
                        }
                        Err(source) => {
                            return Err(EscapeError::Unresolvable {
                                path: relative.to_path_buf(),
                                source,
                            })
                        }
                    };
                }
            }
        }

        if !self.contains(&resolved) {
            return Err(EscapeError::OutsideSandbox {
                path: relative.to_path_buf(),
                resolved,
                root: self.root.clone(),
            });
        }

        Ok(resolved)
    }
}

/// Resolves `relative` inside `sandbox_root`. See [`PathGuard::resolve`].
pub fn resolve(sandbox_root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf, EscapeError> {
    PathGuard::new(sandbox_root)?.resolve(relative)
}
