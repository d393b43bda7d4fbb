//! Sizing and unpacking uploaded archives without blocking the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use droplet_blocking::{BlockingPool, Cancelled};
use tracing::instrument;
use walkdir::WalkDir;

use crate::archive::{ArchiveTool, BuiltinArchiveTool, ToolError};
use crate::path_guard::PathGuard;

/// An error returned by [`ArchiveExtractor`].
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("failed listing archive entries of '{}'", .path.display())]
    ListingFailed {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to extract '{}'", .path.display())]
    ExtractFailed {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    /// A symlink in the extracted tree dangles or points outside of the sandbox.
    #[error("extracted entry '{}' points outside of the sandbox", .0.display())]
    EntryOutsideSandbox(PathBuf),

    /// The extracted files take more space than the archive listing declared.
    #[error("extracted {extracted} bytes but the archive only declared {limit}")]
    SizeExceeded { extracted: u64, limit: u64 },

    #[error("failed to verify the extracted files")]
    Verify(#[from] walkdir::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Runs the archive tool on the blocking pool.
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    tool: Arc<dyn ArchiveTool>,
    blocking: BlockingPool,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinArchiveTool), BlockingPool::default())
    }
}

impl ArchiveExtractor {
    pub fn new(tool: Arc<dyn ArchiveTool>, blocking: BlockingPool) -> Self {
        Self { tool, blocking }
    }

    /// Lists the archive and sums the declared uncompressed size of every entry. Nothing is
    /// extracted, so a corrupt or oversized upload is rejected before any file is written.
    #[instrument(skip_all, fields(archive = %archive.display()))]
    pub async fn compute_uncompressed_size(&self, archive: &Path) -> Result<u64, ExtractionError> {
        let tool = Arc::clone(&self.tool);
        let path = archive.to_path_buf();
        let size = self
            .blocking
            .defer(move || {
                let entries = tool
                    .list(&path)
                    .map_err(|source| ExtractionError::ListingFailed { path, source })?;
                Ok::<_, ExtractionError>(
                    entries
                        .iter()
                        .fold(0u64, |total, entry| total.saturating_add(entry.size)),
                )
            })
            .await?;

        tracing::debug!("archive expands to {size} bytes");
        Ok(size)
    }

    /// Extracts `archive` into the sandbox of `guard` and then checks that every symlink in the
    /// sandbox resolves to something inside it and that the sandbox did not grow by more than the
    /// archive listing declared.
    #[instrument(skip_all, fields(archive = %archive.display(), sandbox = %guard.root().display()))]
    pub async fn unpack(&self, guard: &PathGuard, archive: &Path) -> Result<(), ExtractionError> {
        let tool = Arc::clone(&self.tool);
        let guard = guard.clone();
        let path = archive.to_path_buf();
        self.blocking
            .defer(move || {
                let listed = match tool.list(&path) {
                    Ok(entries) => entries
                        .iter()
                        .fold(0u64, |total, entry| total.saturating_add(entry.size)),
                    Err(source) => return Err(ExtractionError::ListingFailed { path, source }),
                };
                let existing = extracted_size(&guard)?;

                tool.extract(&path, guard.root())
                    .map_err(|source| ExtractionError::ExtractFailed { path, source })?;
                verify_sandbox(&guard, existing.saturating_add(listed))
            })
            .await?;

        tracing::debug!("unpacked archive");
        Ok(())
    }
}

/// Walks the sandbox without following links and fails on the first symlink that cannot be
/// resolved or that resolves to a path outside of the sandbox, or if the regular files in the
/// sandbox add up to more than `size_limit` bytes.
pub fn verify_sandbox(guard: &PathGuard, size_limit: u64) -> Result<(), ExtractionError> {
    for entry in WalkDir::new(guard.root()).follow_links(false) {
        let entry = entry?;
        if !entry.path_is_symlink() {
            continue;
        }
        match dunce::canonicalize(entry.path()) {
            Ok(target) if guard.contains(&target) => {}
            _ => return Err(ExtractionError::EntryOutsideSandbox(entry.into_path())),
        }
    }

    let extracted = extracted_size(guard)?;
    if extracted > size_limit {
        return Err(ExtractionError::SizeExceeded {
            extracted,
            limit: size_limit,
        });
    }
    Ok(())
}

/// Sums the sizes of the regular files in the sandbox. Hard linked files are counted once.
fn extracted_size(guard: &PathGuard) -> Result<u64, ExtractionError> {
    #[cfg(unix)]
    let mut seen = std::collections::HashSet::new();

    let mut total = 0u64;
    for entry in WalkDir::new(guard.root()).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
                continue;
            }
        }

        total = total.saturating_add(metadata.len());
    }
    Ok(total)
}
