use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use fs_err as fs;

use super::{ArchiveEntry, ArchiveFormat, ArchiveTool, EntryKind, ToolError};

/// An [`ArchiveTool`] that spawns the `unzip`, `zip` and `tar` executables.
///
/// Output of `tar -tv` is parsed in the GNU layout. Before anything is extracted the archive is
/// listed and refused if an entry name is absolute, contains `..`, or would be written through a
/// symlink that the archive itself creates.
#[derive(Debug, Clone)]
pub struct CommandArchiveTool {
    unzip: PathBuf,
    zip: PathBuf,
    tar: PathBuf,
}

impl CommandArchiveTool {
    /// Constructs a tool from explicit executable locations.
    pub fn new(unzip: impl Into<PathBuf>, zip: impl Into<PathBuf>, tar: impl Into<PathBuf>) -> Self {
        Self {
            unzip: unzip.into(),
            zip: zip.into(),
            tar: tar.into(),
        }
    }

    /// Locates all required executables on the `PATH`.
    pub fn from_path() -> Result<Self, ToolError> {
        Ok(Self::new(find("unzip")?, find("zip")?, find("tar")?))
    }
}

fn find(program: &str) -> Result<PathBuf, ToolError> {
    which::which(program).map_err(|err| ToolError::ProgramNotFound(program.to_string(), err))
}

impl ArchiveTool for CommandArchiveTool {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ToolError> {
        match ArchiveFormat::detect(archive)?.ok_or(ToolError::UnsupportedArchiveType)? {
            ArchiveFormat::Zip => {
                let stdout = run(Command::new(&self.unzip).arg("-Z").arg("-s").arg(archive))?;
                Ok(parse_zipinfo(&stdout))
            }
            ArchiveFormat::Tar => {
                let stdout = run(Command::new(&self.tar).arg("-tvf").arg(archive))?;
                parse_tar_listing(&self.tar, &stdout)
            }
        }
    }

    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ToolError> {
        let entries = self.list(archive)?;
        check_entries(&entries)?;

        match ArchiveFormat::detect(archive)?.ok_or(ToolError::UnsupportedArchiveType)? {
            ArchiveFormat::Zip => run(Command::new(&self.unzip)
                .arg("-qq")
                .arg("-o")
                .arg(archive)
                .arg("-d")
                .arg(destination))?,
            ArchiveFormat::Tar => run(Command::new(&self.tar)
                .arg("-xf")
                .arg(archive)
                .arg("-C")
                .arg(destination)
                .arg("--no-same-owner"))?,
        };
        Ok(())
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

        // `zip` refuses to update an existing file that is not a zip archive, which includes the
        // empty placeholder a caller may have reserved.
        match fs::remove_file(output) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let output = std::path::absolute(output)?;

        // Archiving `.` instead of a glob picks up hidden files.
        match format {
            ArchiveFormat::Zip => run(Command::new(&self.zip)
                .current_dir(source)
                .arg("-q")
                .arg("-r")
                .arg("-y")
                .arg(&output)
                .arg("."))?,
            ArchiveFormat::Tar => run(Command::new(&self.tar)
                .arg("-cf")
                .arg(&output)
                .arg("-C")
                .arg(source)
                .arg("."))?,
        };
        Ok(())
    }
}

/// Runs the command to completion and returns its stdout.
fn run(command: &mut Command) -> Result<String, ToolError> {
    let program = PathBuf::from(command.get_program());
    tracing::debug!("running {command:?}");

    let output = command
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(ToolError::CommandFailed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Splits off `count` whitespace separated fields and returns them together with the rest of the
/// line, which keeps any whitespace inside a file name intact.
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

fn kind_from_mode(mode: &str) -> EntryKind {
    match mode.chars().next() {
        Some('-') => EntryKind::File,
        Some('d') => EntryKind::Directory,
        Some('l') => EntryKind::Symlink,
        Some('h') => EntryKind::HardLink,
        _ => EntryKind::Other,
    }
}

/// Parses the short `zipinfo` format:
///
/// ```text
/// Archive:  app.zip
/// Zip file size: 1290 bytes, number of entries: 2
/// -rw-r--r--  3.0 unx     1024 tx defN 24-Jan-01 00:00 index.php
/// lrwxrwxrwx  3.0 unx        9 bx stor 24-Jan-01 00:00 current
/// 2 files, 1033 bytes uncompressed, 612 bytes compressed:  40.7%
/// ```
///
/// Header and trailer lines are recognized by not starting with a mode string.
fn parse_zipinfo(stdout: &str) -> Vec<ArchiveEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let (fields, name) = split_fields(line, 8)?;
            let kind = kind_from_mode(fields[0]);
            let size = fields[3].parse().ok()?;
            (kind != EntryKind::Other && fields[0].len() >= 7 && !name.is_empty()).then(|| {
                ArchiveEntry {
                    name: name.to_string(),
                    size,
                    kind,
                }
            })
        })
        .collect()
}

/// Parses the verbose GNU tar listing:
///
/// ```text
/// -rw-r--r-- root/root      1024 2024-01-01 00:00 ./index.php
/// lrwxrwxrwx root/root         0 2024-01-01 00:00 ./current -> lib
/// hrw-r--r-- root/root         0 2024-01-01 00:00 ./copy.php link to ./index.php
/// ```
fn parse_tar_listing(program: &Path, stdout: &str) -> Result<Vec<ArchiveEntry>, ToolError> {
    let unexpected = |line: &str| ToolError::UnexpectedOutput {
        program: program.to_path_buf(),
        line: line.to_string(),
    };

    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (fields, rest) = split_fields(line, 5).ok_or_else(|| unexpected(line))?;
            let kind = kind_from_mode(fields[0]);
            let size = fields[2].parse().map_err(|_| unexpected(line))?;
            let name = match kind {
                EntryKind::Symlink => rest.split_once(" -> ").map_or(rest, |(name, _)| name),
                EntryKind::HardLink => rest.split_once(" link to ").map_or(rest, |(name, _)| name),
                _ => rest,
            };
            Ok(ArchiveEntry {
                name: name.to_string(),
                size,
                kind,
            })
        })
        .collect()
}

/// Keeps only the normal components, so `./a/b` and `a/b/` compare equal.
fn normalized(name: &str) -> PathBuf {
    Path::new(name)
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}

/// Refuses listings that an external tool could be tricked into extracting outside of the
/// destination.
fn check_entries(entries: &[ArchiveEntry]) -> Result<(), ToolError> {
    for entry in entries {
        super::builtin::entry_path(&entry.name)?;
    }

    let links: Vec<(usize, PathBuf)> = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.kind == EntryKind::Symlink)
        .map(|(index, entry)| (index, normalized(&entry.name)))
        .collect();
    if links.is_empty() {
        return Ok(());
    }

    for (index, entry) in entries.iter().enumerate() {
        let path = normalized(&entry.name);
        if links
            .iter()
            .any(|(link_index, link)| *link_index != index && path.starts_with(link))
        {
            return Err(ToolError::UnsafeEntry(entry.name.clone()));
        }
    }
    Ok(())
}
