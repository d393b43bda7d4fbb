//! Streaming writer that stores its content in the pool under the content's hash.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use droplet_digest::{HashingWriter, Sha1, Sha1Hash};
use fs_err as fs;

use crate::{path_for_hash, temp_dir};

/// Writes content into the pool.
///
/// Content is written to a temporary file, and when [`PoolWriter::finish`] is called the file is
/// moved to its final location based on its SHA-1 hash. Dropping the writer without calling
/// `finish` discards the content.
pub struct PoolWriter {
    root: PathBuf,
    temp_path: tempfile::TempPath,
    writer: HashingWriter<std::fs::File, Sha1>,
}

impl PoolWriter {
    /// Opens a new temporary file in the pool rooted at `root`.
    ///
    /// The temporary file lives inside the pool itself so that [`PoolWriter::finish`] is a rename
    /// on the same filesystem. Readers of the pool never see a partially written entry.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        // Create the staging directory of the pool on first use.
        let temp_dir = temp_dir(root);
        fs::create_dir_all(&temp_dir)?;

        let temp_file = tempfile::Builder::new().tempfile_in(&temp_dir)?;
        let (file, temp_path) = temp_file.into_parts();
        Ok(PoolWriter {
            root: root.to_path_buf(),
            temp_path,
            writer: HashingWriter::new(file),
        })
    }

    /// Moves the written content to its hash based location and returns the hash. If the pool
    /// already holds the same content the new copy is discarded.
    pub fn finish(mut self) -> std::io::Result<Sha1Hash> {
        self.writer.flush()?;

        // The hash of everything written so far decides where the entry ends up.
        let (file, hash) = self.writer.finalize();
        let path = self.root.join(path_for_hash(&hash));

        // Entries are fanned out over directories named after the first bytes of the hash.
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Close the handle before the file is renamed into place.
        drop(file);

        // Two uploads of the same content may race here. Equal hashes mean equal content, so the
        // loser simply drops its copy.
        match self
            .temp_path
            .persist_noclobber(&path)
            .map_err(std::io::Error::from)
        {
            Ok(()) => Ok(hash),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(hash),
            Err(err) => Err(err),
        }
    }
}

impl Write for PoolWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
