#![deny(missing_docs)]

//! A content addressable pool of application files.
//!
//! Clients that push an application first ask which of their files are already known by SHA-1
//! hash and only upload the rest. During intake the known files are copied out of the pool into
//! the application directory. The [`ResourcePool`] trait is that contract; [`LocalResourcePool`]
//! implements it on top of a local directory.
//!
//! # Layout
//!
//! Files are stored under their lowercase hex SHA-1 hash:
//! ```text
//! <pool_root>/
//!   <first 2 hex chars>/
//!     <next 2 hex chars>/
//!       <remaining hex chars>
//! ```
//!
//! Writes go through a temporary file in `<pool_root>/.tmp` that is renamed into place once the
//! hash is known, so readers never observe a partially written entry and concurrent writers of
//! the same content converge on a single file.

mod writer;

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use droplet_digest::Sha1Hash;
use fs_err as fs;

pub use writer::PoolWriter;

/// Errors returned by a [`ResourcePool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool does not hold an entry with the given hash.
    #[error("resource {0} is not in the resource pool")]
    NotFound(String),

    /// Reading or writing the pool failed.
    #[error("resource pool io error on '{}'", .path.display())]
    Io {
        /// The path that was accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PoolError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The operations the intake pipeline needs from a content addressable pool.
///
/// Implementations must tolerate concurrent readers. All methods block on filesystem or network
/// access and should be called from a blocking context.
pub trait ResourcePool: Send + Sync {
    /// Returns the size in bytes of the entry with the given hash.
    fn size_of(&self, hash: &Sha1Hash) -> Result<u64, PoolError>;

    /// Returns true if the pool holds an entry with the given hash that it is willing to hand
    /// out.
    fn contains(&self, hash: &Sha1Hash) -> bool;

    /// Copies the content of the entry with the given hash to `destination`, replacing a regular
    /// file that already exists there. The destination must already have been validated by the
    /// caller; the pool does not know about sandboxes.
    fn materialize(&self, hash: &Sha1Hash, destination: &Path) -> Result<(), PoolError>;

    /// Adds the file at `path` to the pool. Returns `None` if the pool does not accept the file,
    /// for instance because it is outside the pool's size window.
    fn add_file(&self, path: &Path) -> Result<Option<Sha1Hash>, PoolError>;
}

/// A [`ResourcePool`] stored in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalResourcePool {
    root: PathBuf,
    minimum_size: u64,
    maximum_size: u64,
}

impl LocalResourcePool {
    /// Constructs a pool rooted at `root` that accepts files of any size. The directory is created
    /// lazily on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            minimum_size: 0,
            maximum_size: u64::MAX,
        }
    }

    /// Only pool files whose size is within `minimum_size..=maximum_size`.
    #[must_use]
    pub fn with_size_window(mut self, minimum_size: u64, maximum_size: u64) -> Self {
        self.minimum_size = minimum_size;
        self.maximum_size = maximum_size;
        self
    }

    /// Returns the root directory of the pool.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the absolute location of the entry with the given hash. The file might not exist.
    pub fn entry_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.root.join(path_for_hash(hash))
    }

    fn in_window(&self, size: u64) -> bool {
        (self.minimum_size..=self.maximum_size).contains(&size)
    }
}

impl ResourcePool for LocalResourcePool {
    fn size_of(&self, hash: &Sha1Hash) -> Result<u64, PoolError> {
        let path = self.entry_path(hash);
        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => Err(PoolError::NotFound(format!("{hash:x}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(PoolError::NotFound(format!("{hash:x}")))
            }
            Err(err) => Err(PoolError::io(path, err)),
        }
    }

    fn contains(&self, hash: &Sha1Hash) -> bool {
        std::fs::metadata(self.entry_path(hash))
            .is_ok_and(|metadata| metadata.is_file() && self.in_window(metadata.len()))
    }

    fn materialize(&self, hash: &Sha1Hash, destination: &Path) -> Result<(), PoolError> {
        let source = self.entry_path(hash);
        if !source.is_file() {
            return Err(PoolError::NotFound(format!("{hash:x}")));
        }

        match std::fs::symlink_metadata(destination) {
            Ok(metadata) if metadata.is_dir() => {
                return Err(PoolError::io(
                    destination,
                    std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "a directory exists at the destination",
                    ),
                ));
            }
            Ok(_) => fs::remove_file(destination).map_err(|e| PoolError::io(destination, e))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(PoolError::io(destination, err)),
        }

        tracing::trace!("materializing {hash:x} at {}", destination.display());
        reflink_copy::reflink_or_copy(&source, destination)
            .map_err(|e| PoolError::io(destination, e))?;
        Ok(())
    }

    fn add_file(&self, path: &Path) -> Result<Option<Sha1Hash>, PoolError> {
        let metadata = fs::metadata(path).map_err(|e| PoolError::io(path, e))?;
        if !metadata.is_file() || !self.in_window(metadata.len()) {
            return Ok(None);
        }

        let mut file = fs::File::open(path).map_err(|e| PoolError::io(path, e))?;
        let mut writer = PoolWriter::create(&self.root).map_err(|e| PoolError::io(&self.root, e))?;
        std::io::copy(&mut file, &mut writer).map_err(|e| PoolError::io(path, e))?;
        let hash = writer.finish().map_err(|e| PoolError::io(&self.root, e))?;
        Ok(Some(hash))
    }
}

/// Returns the directory to use for temporary files.
fn temp_dir(root: &Path) -> PathBuf {
    root.join(".tmp")
}

/// Returns the path relative to the pool root for a given hash. Note that the path might not
/// exist.
pub fn path_for_hash(hash: &Sha1Hash) -> PathBuf {
    let hash_str = format!("{hash:x}");
    PathBuf::from(&hash_str[0..2])
        .join(&hash_str[2..4])
        .join(&hash_str[4..])
}

/// Writes the contents of a reader to the pool rooted at `root` and returns the hash of the
/// written content.
pub fn write_sync(root: &Path, reader: &mut impl std::io::Read) -> std::io::Result<Sha1Hash> {
    let mut w = PoolWriter::create(root)?;
    std::io::copy(reader, &mut w)?;
    w.finish()
}
