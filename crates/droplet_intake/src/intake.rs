//! The intake pipeline: from an uploaded archive and a list of pooled resources to a validated
//! application directory.

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use droplet_blocking::BlockingPool;
use droplet_digest::{HashingReader, Sha1, Sha1Hash};
use droplet_resource_pool::ResourcePool;
use fs_err as fs;
use tracing::instrument;
use walkdir::WalkDir;

use crate::archive::{ArchiveFormat, ArchiveTool, BuiltinArchiveTool};
use crate::config::IntakeConfig;
use crate::descriptor::ResourceDescriptor;
use crate::error::IntakeError;
use crate::extractor::ArchiveExtractor;
use crate::path_guard::{EscapeError, PathGuard};
use crate::quota;
use crate::repack::Repackager;
use crate::skeleton::create_skeleton;

/// A repacked application ready to be handed to staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPackage {
    /// Location of the archive.
    pub path: PathBuf,
    /// SHA-1 of the archive.
    pub sha1: Sha1Hash,
    /// Size of the archive in bytes.
    pub size: u64,
}

/// Turns uploads into application directories.
///
/// Every blocking step (listing, extracting, pool access, repacking) runs on the [`BlockingPool`],
/// so many intakes can be driven concurrently from a single-threaded runtime. Instances are cheap
/// to clone and clones share the pool and the resource pool.
#[derive(Clone)]
pub struct PackageIntake {
    pool: Arc<dyn ResourcePool>,
    tool: Arc<dyn ArchiveTool>,
    blocking: BlockingPool,
    extractor: ArchiveExtractor,
    repackager: Repackager,
    max_package_size: u64,
    package_format: ArchiveFormat,
}

impl Debug for PackageIntake {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageIntake")
            .field("tool", &self.tool)
            .field("blocking", &self.blocking)
            .field("max_package_size", &self.max_package_size)
            .field("package_format", &self.package_format)
            .finish_non_exhaustive()
    }
}

impl PackageIntake {
    /// Constructs an intake pipeline that uses the in-process archive tool and a blocking pool
    /// sized by the configuration.
    pub fn new(config: &IntakeConfig, pool: Arc<dyn ResourcePool>) -> Self {
        let tool: Arc<dyn ArchiveTool> = Arc::new(BuiltinArchiveTool);
        let blocking = BlockingPool::new(config.concurrency.blocking_tasks);
        Self {
            pool,
            extractor: ArchiveExtractor::new(Arc::clone(&tool), blocking.clone()),
            repackager: Repackager::new(Arc::clone(&tool), blocking.clone()),
            tool,
            blocking,
            max_package_size: config.max_package_size,
            package_format: config.package_format,
        }
    }

    /// Use a different archive tool, for instance a [`crate::CommandArchiveTool`].
    #[must_use]
    pub fn with_archive_tool(mut self, tool: Arc<dyn ArchiveTool>) -> Self {
        self.tool = tool;
        self.rebuild();
        self
    }

    /// Share a blocking pool with other parts of the process instead of owning one.
    #[must_use]
    pub fn with_blocking_pool(mut self, blocking: BlockingPool) -> Self {
        self.blocking = blocking;
        self.rebuild();
        self
    }

    fn rebuild(&mut self) {
        self.extractor = ArchiveExtractor::new(Arc::clone(&self.tool), self.blocking.clone());
        self.repackager = Repackager::new(Arc::clone(&self.tool), self.blocking.clone());
    }

    pub fn max_package_size(&self) -> u64 {
        self.max_package_size
    }

    pub fn resource_pool(&self) -> &Arc<dyn ResourcePool> {
        &self.pool
    }

    /// Populates the existing directory `sandbox_root` with the content of `archive` and the
    /// pooled `resources` and returns its canonical path.
    ///
    /// The archive is sized before anything is written, and the total including all pooled
    /// resources is checked against the package budget before the archive is extracted. Without
    /// an archive the package consists of pooled resources only. On failure the sandbox directory
    /// is removed.
    #[instrument(skip_all, fields(sandbox = %sandbox_root.display(), resources = resources.len()))]
    pub async fn intake(
        &self,
        sandbox_root: &Path,
        archive: Option<&Path>,
        resources: &[ResourceDescriptor],
    ) -> Result<PathBuf, IntakeError> {
        for resource in resources {
            let mode = resource.effective_mode();
            if !mode.grants_owner_read_write() {
                return Err(IntakeError::InvalidResourceMode {
                    path: resource.path.clone(),
                    mode,
                });
            }
        }

        let guard = PathGuard::new(sandbox_root).map_err(|err| match err {
            EscapeError::Unresolvable { path, source } => IntakeError::Io { path, source },
            err => err.into(),
        })?;
        match self.assemble(&guard, archive, resources).await {
            Ok(total) => {
                tracing::info!("accepted package of {total} bytes");
                Ok(guard.root().to_path_buf())
            }
            Err(err) => {
                tracing::debug!("intake failed, discarding sandbox: {err}");
                self.discard_sandbox(&guard).await;
                Err(err)
            }
        }
    }

    async fn assemble(
        &self,
        guard: &PathGuard,
        archive: Option<&Path>,
        resources: &[ResourceDescriptor],
    ) -> Result<u64, IntakeError> {
        let upload_size = match archive {
            Some(archive) => self.extractor.compute_uncompressed_size(archive).await?,
            None => 0,
        };

        let pool = Arc::clone(&self.pool);
        let resources = Arc::<[ResourceDescriptor]>::from(resources);
        let budget = self.max_package_size;
        let total = {
            let resources = Arc::clone(&resources);
            self.blocking
                .defer(move || {
                    quota::check_size(upload_size, &resources, pool.as_ref(), budget)
                        .map_err(IntakeError::from)
                })
                .await?
        };

        if let Some(archive) = archive {
            self.extractor.unpack(guard, archive).await?;
        }

        if !resources.is_empty() {
            let pool = Arc::clone(&self.pool);
            let guard = guard.clone();
            self.blocking
                .defer(move || materialize_resources(&guard, &resources, pool.as_ref()))
                .await?;
        }

        Ok(total)
    }

    async fn discard_sandbox(&self, guard: &PathGuard) {
        let root = guard.root().to_path_buf();
        let result = self
            .blocking
            .defer(move || {
                fs::remove_dir_all(&root).map_err(|source| IntakeError::Io { path: root, source })
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(
                "failed to remove sandbox {}: {err}",
                guard.root().display()
            );
        }
    }

    /// Runs [`PackageIntake::intake`] and packs the resulting directory into a new archive inside
    /// `output_dir`. Without an explicit format the configured package format is used.
    #[instrument(skip_all, fields(sandbox = %sandbox_root.display()))]
    pub async fn stage(
        &self,
        sandbox_root: &Path,
        archive: Option<&Path>,
        resources: &[ResourceDescriptor],
        output_dir: &Path,
        format: Option<ArchiveFormat>,
    ) -> Result<StagedPackage, IntakeError> {
        let app_dir = self.intake(sandbox_root, archive, resources).await?;
        let format = format.unwrap_or(self.package_format);
        let path = self.repackager.repack(&app_dir, output_dir, format).await?;

        let (sha1, size) = {
            let path = path.clone();
            self.blocking
                .defer(move || {
                    fingerprint(&path).map_err(|source| IntakeError::Io { path, source })
                })
                .await?
        };

        tracing::info!("staged {} ({size} bytes, sha1 {sha1:x})", path.display());
        Ok(StagedPackage { path, sha1, size })
    }

    /// Returns the resources the pool already holds, so the client can leave them out of the
    /// upload.
    pub async fn match_resources(
        &self,
        resources: &[ResourceDescriptor],
    ) -> Result<Vec<ResourceDescriptor>, IntakeError> {
        let pool = Arc::clone(&self.pool);
        let resources = resources.to_vec();
        self.blocking
            .defer(move || {
                Ok::<_, IntakeError>(
                    resources
                        .into_iter()
                        .filter(|resource| pool.contains(&resource.sha1))
                        .collect(),
                )
            })
            .await
    }

    /// Adds every regular file below `app_dir` to the resource pool and returns how many files
    /// the pool accepted. Symlinks are not followed.
    #[instrument(skip_all, fields(app_dir = %app_dir.display()))]
    pub async fn populate_resource_pool(&self, app_dir: &Path) -> Result<usize, IntakeError> {
        let pool = Arc::clone(&self.pool);
        let app_dir = app_dir.to_path_buf();
        let added = self
            .blocking
            .defer(move || {
                let mut added = 0;
                for entry in WalkDir::new(&app_dir).follow_links(false) {
                    let entry = entry.map_err(|err| IntakeError::Io {
                        path: err.path().unwrap_or(&app_dir).to_path_buf(),
                        source: err.into(),
                    })?;
                    if entry.file_type().is_file() && pool.add_file(entry.path())?.is_some() {
                        added += 1;
                    }
                }
                Ok::<_, IntakeError>(added)
            })
            .await?;

        tracing::debug!("added {added} files to the resource pool");
        Ok(added)
    }
}

/// Copies every resource out of the pool into the sandbox.
fn materialize_resources(
    guard: &PathGuard,
    resources: &[ResourceDescriptor],
    pool: &dyn ResourcePool,
) -> Result<(), IntakeError> {
    for resource in resources {
        let destination = create_skeleton(guard, resource.destination())?;
        pool.materialize(&resource.sha1, &destination)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(resource.effective_mode().bits());
            fs::set_permissions(&destination, permissions).map_err(|source| IntakeError::Io {
                path: destination.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Computes the SHA-1 and the size of a file in a single pass.
fn fingerprint(path: &Path) -> std::io::Result<(Sha1Hash, u64)> {
    let mut reader = HashingReader::<_, Sha1>::new(fs::File::open(path)?);
    let size = std::io::copy(&mut reader, &mut std::io::sink())?;
    let (_, sha1) = reader.finalize();
    Ok((sha1, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use droplet_digest::compute_bytes_digest;
    use droplet_resource_pool::{write_sync, LocalResourcePool};
    use std::io::Cursor;

    use crate::descriptor::FileMode;
    use crate::error::IntakeErrorKind;

    struct Fixture {
        temp_dir: tempfile::TempDir,
        pool: Arc<LocalResourcePool>,
        sandbox: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(LocalResourcePool::new(temp_dir.path().join("pool")));
        let sandbox = temp_dir.path().join("sandbox");
        std::fs::create_dir(&sandbox).unwrap();
        Fixture {
            temp_dir,
            pool,
            sandbox,
        }
    }

    fn intake(fixture: &Fixture) -> PackageIntake {
        PackageIntake::new(&IntakeConfig::default(), fixture.pool.clone())
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_resources_only() {
        let fixture = fixture();
        let hash = write_sync(fixture.pool.root(), &mut Cursor::new(b"<?php")).unwrap();
        let resources = [ResourceDescriptor::new(hash, "public/index.php")];

        let app_dir = intake(&fixture)
            .intake(&fixture.sandbox, None, &resources)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(app_dir.join("public/index.php")).unwrap(),
            b"<?php"
        );
        assert!(logs_contain("accepted package of 5 bytes"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resource_mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = fixture();
        let hash = write_sync(fixture.pool.root(), &mut Cursor::new(b"#!/bin/sh")).unwrap();
        let resources =
            [ResourceDescriptor::new(hash, "bin/run").with_mode(FileMode::new(0o755).unwrap())];

        let app_dir = intake(&fixture)
            .intake(&fixture.sandbox, None, &resources)
            .await
            .unwrap();
        let mode = std::fs::metadata(app_dir.join("bin/run"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_invalid_mode_is_rejected_before_any_io() {
        let fixture = fixture();
        let resources = [ResourceDescriptor::new(compute_bytes_digest::<Sha1>(""), "a.txt")
            .with_mode(FileMode::new(0o444).unwrap())];

        let err = intake(&fixture)
            .intake(&fixture.sandbox, None, &resources)
            .await
            .unwrap_err();
        assert_matches!(err, IntakeError::InvalidResourceMode { .. });
        assert_eq!(err.kind(), IntakeErrorKind::InvalidInput);
        // Nothing was touched, not even the sandbox.
        assert!(fixture.sandbox.is_dir());
    }

    #[tokio::test]
    async fn test_missing_sandbox() {
        let fixture = fixture();
        let err = intake(&fixture)
            .intake(&fixture.temp_dir.path().join("missing"), None, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), IntakeErrorKind::Io);
    }

    #[tokio::test]
    async fn test_match_resources() {
        let fixture = fixture();
        let known = write_sync(fixture.pool.root(), &mut Cursor::new(b"known")).unwrap();
        let unknown = compute_bytes_digest::<Sha1>("unknown");
        let resources = [
            ResourceDescriptor::new(known, "known.txt"),
            ResourceDescriptor::new(unknown, "unknown.txt"),
        ];

        let matched = intake(&fixture).match_resources(&resources).await.unwrap();
        assert_eq!(matched, vec![resources[0].clone()]);
    }

    #[test]
    fn test_fingerprint() {
        let fixture = fixture();
        let path = fixture.temp_dir.path().join("package");
        std::fs::write(&path, "Hello, world!").unwrap();

        let (sha1, size) = fingerprint(&path).unwrap();
        assert_eq!(sha1, compute_bytes_digest::<Sha1>("Hello, world!"));
        assert_eq!(size, 13);
    }
}
