//! Packing an assembled application directory back into a single archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use droplet_blocking::{BlockingPool, Cancelled};
use fs_err as fs;
use tracing::instrument;

use crate::archive::{ArchiveFormat, ArchiveTool, BuiltinArchiveTool, ToolError};

/// An error returned by [`Repackager::repack`].
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("failed to package '{}'", .app_dir.display())]
    ArchiveFailed {
        app_dir: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to write the package to '{}'", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone)]
pub struct Repackager {
    tool: Arc<dyn ArchiveTool>,
    blocking: BlockingPool,
}

impl Default for Repackager {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinArchiveTool), BlockingPool::default())
    }
}

impl Repackager {
    pub fn new(tool: Arc<dyn ArchiveTool>, blocking: BlockingPool) -> Self {
        Self { tool, blocking }
    }

    /// Archives every entry of `app_dir`, hidden files included, into a new file inside
    /// `output_dir` and returns its path. The output directory is created if needed.
    ///
    /// The file name is unique within `output_dir`, so concurrent calls never clobber each other.
    /// If archiving fails no file is left behind.
    #[instrument(skip_all, fields(app_dir = %app_dir.display(), %format))]
    pub async fn repack(
        &self,
        app_dir: &Path,
        output_dir: &Path,
        format: ArchiveFormat,
    ) -> Result<PathBuf, PackagingError> {
        let tool = Arc::clone(&self.tool);
        let app_dir = app_dir.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let package = self
            .blocking
            .defer(move || {
                let output_error = |source| PackagingError::Output {
                    path: output_dir.clone(),
                    source,
                };

                fs::create_dir_all(&output_dir).map_err(output_error)?;
                let reserved = tempfile::Builder::new()
                    .prefix("package-")
                    .suffix(&format!(".{}", format.extension()))
                    .tempfile_in(&output_dir)
                    .map_err(output_error)?
                    .into_temp_path();

                // Dropping the reservation on failure removes the partial archive.
                tool.create(&app_dir, &reserved, format)
                    .map_err(|source| PackagingError::ArchiveFailed { app_dir, source })?;

                reserved
                    .keep()
                    .map_err(|err| PackagingError::Output {
                        path: err.path.to_path_buf(),
                        source: err.error,
                    })
            })
            .await?;

        tracing::info!("packaged application as {}", package.display());
        Ok(package)
    }
}
