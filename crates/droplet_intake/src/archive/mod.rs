//! The archive tool collaborator: listing, extracting and creating application archives.
//!
//! [`ArchiveTool`] is the seam between the intake pipeline and whatever actually reads and writes
//! archives. [`BuiltinArchiveTool`] does the work in-process with the `zip` and `tar` crates,
//! [`CommandArchiveTool`] shells out to `unzip`, `zip` and `tar`. All methods block and are only
//! ever called through a [`droplet_blocking::BlockingPool`].

mod builtin;
mod command;

use std::fmt::{Display, Formatter};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

use crate::path_guard::EscapeError;
use crate::skeleton::SkeletonError;

pub use builtin::BuiltinArchiveTool;
pub use command::CommandArchiveTool;

/// The archive formats the intake pipeline reads and writes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// A zip archive.
    #[default]
    Zip,
    /// An uncompressed POSIX tar archive.
    Tar,
}

impl ArchiveFormat {
    /// Returns the file extension (without a leading dot) for archives of this format.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
        }
    }

    /// Determines the format of the archive at `path` from its leading bytes. Returns `None` for
    /// empty files and anything that is not a zip or tar archive.
    pub fn detect(path: &Path) -> std::io::Result<Option<ArchiveFormat>> {
        let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + TAR_MAGIC.len());
        fs_err::File::open(path)?
            .take((TAR_MAGIC_OFFSET + TAR_MAGIC.len()) as u64)
            .read_to_end(&mut header)?;
        Ok(Self::from_magic(&header))
    }

    fn from_magic(header: &[u8]) -> Option<ArchiveFormat> {
        if header.starts_with(ZIP_LOCAL_HEADER_MAGIC) || header.starts_with(ZIP_EMPTY_ARCHIVE_MAGIC)
        {
            Some(ArchiveFormat::Zip)
        } else if header.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
            == Some(TAR_MAGIC)
        {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

const ZIP_LOCAL_HEADER_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE_MAGIC: &[u8] = b"PK\x05\x06";
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// The kind of filesystem object an archive entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    Other,
}

/// A single entry as reported by listing an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// The name of the entry as stored in the archive. This is untrusted input.
    pub name: String,
    /// The declared uncompressed size in bytes.
    pub size: u64,
    pub kind: EntryKind,
}

/// Reads and writes application archives.
pub trait ArchiveTool: std::fmt::Debug + Send + Sync {
    /// Lists the entries of an archive without extracting it.
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ToolError>;

    /// Extracts every entry of `archive` into the existing directory `destination`.
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ToolError>;

    /// Creates an archive at `output` that contains every entry below `source`, including
    /// entries whose name starts with a dot.
    fn create(&self, source: &Path, output: &Path, format: ArchiveFormat)
        -> Result<(), ToolError>;
}

/// Errors reported by an [`ArchiveTool`].
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("an io error occurred")]
    Io(#[from] std::io::Error),

    #[error("invalid zip archive")]
    Zip(#[from] zip::result::ZipError),

    #[error("unsupported archive format")]
    UnsupportedArchiveType,

    #[error("archive entry '{0}' has an unsafe path")]
    UnsafeEntry(String),

    #[error("archive entry '{name}' expands beyond its declared size of {declared} bytes")]
    EntryTooLarge { name: String, declared: u64 },

    #[error(transparent)]
    Escape(#[from] EscapeError),

    #[error(transparent)]
    Skeleton(#[from] SkeletonError),

    #[error("failed to walk the directory tree")]
    Walk(#[from] walkdir::Error),

    #[error("could not find `{0}`")]
    ProgramNotFound(String, #[source] which::Error),

    #[error("`{program}` failed ({status}): {stderr}")]
    CommandFailed {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },

    #[error("unexpected output from `{}`: {line}", .program.display())]
    UnexpectedOutput { program: PathBuf, line: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zip(b"PK\x03\x04rest-of-header".to_vec(), Some(ArchiveFormat::Zip))]
    #[case::empty_zip(b"PK\x05\x06\0\0\0\0".to_vec(), Some(ArchiveFormat::Zip))]
    #[case::empty(Vec::new(), None)]
    #[case::text(b"this is not an archive".to_vec(), None)]
    fn test_from_magic(#[case] header: Vec<u8>, #[case] expected: Option<ArchiveFormat>) {
        assert_eq!(ArchiveFormat::from_magic(&header), expected);
    }

    #[test]
    fn test_detect_tar() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("app.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
        let mut header = tar::Header::new_ustar();
        header.set_size(5);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "index.php", &b"<?php"[..])
            .unwrap();
        builder.finish().unwrap();

        assert_eq!(ArchiveFormat::detect(&path).unwrap(), Some(ArchiveFormat::Tar));
    }

    #[test]
    fn test_format_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ArchiveFormat::Tar).unwrap(),
            "\"tar\""
        );
        assert_eq!(ArchiveFormat::Zip.to_string(), "zip");
    }
}
