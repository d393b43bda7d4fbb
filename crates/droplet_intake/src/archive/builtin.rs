use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use fs_err as fs;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use super::{ArchiveEntry, ArchiveFormat, ArchiveTool, EntryKind, ToolError};
use crate::path_guard::PathGuard;
use crate::skeleton::create_skeleton;

/// An [`ArchiveTool`] that reads and writes archives in-process with the `zip` and `tar` crates.
///
/// Every entry is written through a [`PathGuard`] rooted at the destination: entry names that are
/// absolute or contain `..` are refused outright, and symlink entries are only created if their
/// target stays inside the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinArchiveTool;

impl ArchiveTool for BuiltinArchiveTool {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ToolError> {
        match detect(archive)? {
            ArchiveFormat::Zip => list_zip(archive),
            ArchiveFormat::Tar => list_tar(archive),
        }
    }

    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ToolError> {
        let sink = Sink {
            guard: PathGuard::new(destination)?,
        };
        match detect(archive)? {
            ArchiveFormat::Zip => extract_zip(archive, &sink),
            ArchiveFormat::Tar => extract_tar(archive, &sink),
        }
    }

    fn create(
        &self,
        source: &Path,
        output: &Path,
        format: ArchiveFormat,
    ) -> Result<(), ToolError> {
        if !fs::metadata(source)?.is_dir() {
            return Err(ToolError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("'{}' is not a directory", source.display()),
            )));
        }
        match format {
            ArchiveFormat::Zip => write_zip(source, output),
            ArchiveFormat::Tar => write_tar(source, output),
        }
    }
}

fn detect(archive: &Path) -> Result<ArchiveFormat, ToolError> {
    ArchiveFormat::detect(archive)?.ok_or(ToolError::UnsupportedArchiveType)
}

/// Converts an entry name read from an archive into a sandbox relative path.
pub(super) fn entry_path(name: &str) -> Result<PathBuf, ToolError> {
    let path = Path::new(name);
    let is_safe = !name.is_empty()
        && !name.contains('\0')
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if is_safe {
        Ok(path.to_path_buf())
    } else {
        Err(ToolError::UnsafeEntry(name.to_string()))
    }
}

fn list_zip(archive: &Path) -> Result<Vec<ArchiveEntry>, ToolError> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive)?)?;
    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        let kind = if entry.is_dir() {
            EntryKind::Directory
        } else if entry.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };
        entries.push(ArchiveEntry {
            name: entry.name().to_string(),
            size: entry.size(),
            kind,
        });
    }
    Ok(entries)
}

fn list_tar(archive: &Path) -> Result<Vec<ArchiveEntry>, ToolError> {
    let mut tar = tar::Archive::new(fs::File::open(archive)?);
    let mut entries = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        entries.push(ArchiveEntry {
            name: entry.path()?.to_string_lossy().into_owned(),
            size: entry.size(),
            kind: tar_entry_kind(entry.header().entry_type()),
        });
    }
    Ok(entries)
}

fn tar_entry_kind(entry_type: tar::EntryType) -> EntryKind {
    match entry_type {
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            EntryKind::File
        }
        tar::EntryType::Directory => EntryKind::Directory,
        tar::EntryType::Symlink => EntryKind::Symlink,
        tar::EntryType::Link => EntryKind::HardLink,
        _ => EntryKind::Other,
    }
}

fn extract_zip(archive: &Path, sink: &Sink) -> Result<(), ToolError> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive)?)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();
        let relative = entry_path(&name)?;

        if entry.is_dir() {
            sink.directory(&relative)?;
        } else if entry.is_symlink() {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            sink.symlink(&name, &relative, Path::new(&target))?;
        } else {
            let mode = entry.unix_mode();
            let declared = entry.size();
            sink.file(&name, &relative, &mut entry, declared, mode)?;
        }
    }
    Ok(())
}

fn extract_tar(archive: &Path, sink: &Sink) -> Result<(), ToolError> {
    let mut tar = tar::Archive::new(fs::File::open(archive)?);
    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let relative = entry_path(&name)?;

        match tar_entry_kind(entry.header().entry_type()) {
            EntryKind::Directory => sink.directory(&relative)?,
            EntryKind::File => {
                let mode = entry.header().mode().ok();
                let declared = entry.size();
                sink.file(&name, &relative, &mut entry, declared, mode)?;
            }
            EntryKind::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| ToolError::UnsafeEntry(name.clone()))?
                    .into_owned();
                sink.symlink(&name, &relative, &target)?;
            }
            EntryKind::HardLink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| ToolError::UnsafeEntry(name.clone()))?
                    .into_owned();
                sink.hard_link(&name, &relative, &target)?;
            }
            EntryKind::Other => {
                tracing::debug!("skipping archive entry '{name}' of unsupported type");
            }
        }
    }
    Ok(())
}

/// Writes archive entries into a sandbox.
struct Sink {
    guard: PathGuard,
}

impl Sink {
    fn directory(&self, relative: &Path) -> Result<(), ToolError> {
        if self.guard.resolve(relative)? == self.guard.root() {
            return Ok(());
        }
        let destination = create_skeleton(&self.guard, relative)?;
        match fs::create_dir(&destination) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && destination.is_dir() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes at most `declared` bytes. The listed sizes are what the package budget was checked
    /// against, so an entry that inflates beyond its header is refused.
    fn file(
        &self,
        name: &str,
        relative: &Path,
        content: &mut impl Read,
        declared: u64,
        mode: Option<u32>,
    ) -> Result<(), ToolError> {
        let destination = create_skeleton(&self.guard, relative)?;
        let mut file = fs::File::create(&destination)?;
        let written = std::io::copy(&mut content.take(declared.saturating_add(1)), &mut file)?;
        if written > declared {
            return Err(ToolError::EntryTooLarge {
                name: name.to_string(),
                declared,
            });
        }
        file.flush()?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            // The owner must always be able to read and rewrite what was uploaded.
            let permissions = std::fs::Permissions::from_mode((mode & 0o777) | 0o600);
            fs::set_permissions(&destination, permissions)?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    fn symlink(&self, name: &str, relative: &Path, target: &Path) -> Result<(), ToolError> {
        if target.has_root() || target.as_os_str().is_empty() {
            return Err(ToolError::UnsafeEntry(format!(
                "{name} -> {}",
                target.display()
            )));
        }
        let base = relative.parent().unwrap_or(Path::new(""));
        self.guard.resolve(base.join(target))?;

        let destination = self.vacant_destination(name, relative)?;

        #[cfg(unix)]
        fs_err::os::unix::fs::symlink(target, &destination)?;
        #[cfg(not(unix))]
        tracing::warn!(
            "skipping symlink '{name}', symlinks are not supported on this platform ({})",
            destination.display()
        );

        Ok(())
    }

    fn hard_link(&self, name: &str, relative: &Path, target: &Path) -> Result<(), ToolError> {
        // Hard link targets are relative to the archive root, not to the link.
        let target_name = target.to_string_lossy();
        let source = self.guard.resolve(entry_path(&target_name)?)?;
        let destination = self.vacant_destination(name, relative)?;
        fs::hard_link(&source, &destination)?;
        Ok(())
    }

    /// Links are never written over existing entries, that would allow an archive to redirect a
    /// path that an earlier entry already populated.
    fn vacant_destination(&self, name: &str, relative: &Path) -> Result<PathBuf, ToolError> {
        let destination = create_skeleton(&self.guard, relative)?;
        if std::fs::symlink_metadata(&destination).is_ok() {
            return Err(ToolError::UnsafeEntry(name.to_string()));
        }
        Ok(destination)
    }
}

/// Walks everything below `source` except `source` itself and `output`. Hidden files are
/// included, symlinks are reported as links.
fn walk_source<'a>(
    source: &Path,
    output: &'a Path,
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
    WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter(move |entry| {
            entry
                .as_ref()
                .map_or(true, |entry| entry.path() != output)
        })
}

/// Returns the archive name of `path`, always using `/` as the separator.
fn archive_name(source: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(source).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_zip(source: &Path, output: &Path) -> Result<(), ToolError> {
    let mut writer = zip::ZipWriter::new(fs::File::create(output)?);

    for entry in walk_source(source, output) {
        let entry = entry?;
        let name = archive_name(source, entry.path());
        let metadata = entry.metadata()?;
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(permissions_of(&metadata));

        if metadata.is_dir() {
            writer.add_directory(name, options)?;
        } else if metadata.is_symlink() {
            let target = fs::read_link(entry.path())?;
            writer.add_symlink(name, target.to_string_lossy(), options)?;
        } else if metadata.is_file() {
            writer.start_file(name, options)?;
            let mut file = fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut writer)?;
        } else {
            tracing::debug!("not archiving special file '{}'", entry.path().display());
        }
    }

    writer.finish()?.flush()?;
    Ok(())
}

fn write_tar(source: &Path, output: &Path) -> Result<(), ToolError> {
    let mut builder = tar::Builder::new(fs::File::create(output)?);
    builder.follow_symlinks(false);

    for entry in walk_source(source, output) {
        let entry = entry?;
        let relative = PathBuf::from(archive_name(source, entry.path()));
        append_path_to_archive(&mut builder, entry.path(), &relative)?;
    }

    builder.into_inner()?.flush()?;
    Ok(())
}

fn prepare_header(path: &Path) -> Result<tar::Header, std::io::Error> {
    let mut header = tar::Header::new_gnu();
    let stat = fs::symlink_metadata(path)?;
    header.set_metadata(&stat);

    // Ownership on the uploading machine means nothing to the platform.
    header.set_uid(0);
    header.set_gid(0);
    header.set_device_minor(0)?;
    header.set_device_major(0)?;
    Ok(header)
}

fn append_path_to_archive(
    archive: &mut tar::Builder<impl Write>,
    path: &Path,
    name: &Path,
) -> Result<(), std::io::Error> {
    let mut header = prepare_header(path)?;

    if header.entry_type().is_file() {
        let file = fs::File::open(path)?;
        archive.append_data(&mut header, name, file)?;
    } else if header.entry_type().is_symlink() {
        header.set_size(0);
        let target = fs::read_link(path)?;
        archive.append_link(&mut header, name, target)?;
    } else if header.entry_type().is_dir() {
        header.set_size(0);
        archive.append_data(&mut header, name, std::io::empty())?;
    } else {
        tracing::debug!("not archiving special file '{}'", path.display());
    }

    Ok(())
}

#[cfg(unix)]
fn permissions_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}
