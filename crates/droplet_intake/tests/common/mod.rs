#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use droplet_digest::Sha1Hash;
use droplet_intake::{IntakeConfig, LocalResourcePool, PackageIntake, PoolError, ResourcePool};
use droplet_resource_pool::write_sync;
use zip::write::SimpleFileOptions;

/// A temporary directory with a resource pool and an empty sandbox.
pub struct Fixture {
    pub temp_dir: tempfile::TempDir,
    pub pool: Arc<RecordingPool>,
    pub sandbox: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(RecordingPool::new(LocalResourcePool::new(
            temp_dir.path().join("pool"),
        )));
        let sandbox = temp_dir.path().join("sandbox");
        std::fs::create_dir(&sandbox).unwrap();
        Self {
            temp_dir,
            pool,
            sandbox,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// A new, existing sandbox directory next to the default one.
    pub fn sandbox(&self, name: &str) -> PathBuf {
        let sandbox = self.path(name);
        std::fs::create_dir(&sandbox).unwrap();
        sandbox
    }

    pub fn intake(&self, max_package_size: u64) -> PackageIntake {
        let config = IntakeConfig {
            max_package_size,
            ..IntakeConfig::default()
        };
        PackageIntake::new(&config, self.pool.clone())
    }

    /// Adds `content` to the pool and returns its hash.
    pub fn pool_content(&self, content: &[u8]) -> Sha1Hash {
        write_sync(self.pool.inner.root(), &mut Cursor::new(content)).unwrap()
    }
}

/// A [`ResourcePool`] that counts how often content is copied out of it.
pub struct RecordingPool {
    pub inner: LocalResourcePool,
    materialized: AtomicUsize,
}

impl RecordingPool {
    pub fn new(inner: LocalResourcePool) -> Self {
        Self {
            inner,
            materialized: AtomicUsize::new(0),
        }
    }

    pub fn materialized(&self) -> usize {
        self.materialized.load(Ordering::SeqCst)
    }
}

impl ResourcePool for RecordingPool {
    fn size_of(&self, hash: &Sha1Hash) -> Result<u64, PoolError> {
        self.inner.size_of(hash)
    }

    fn contains(&self, hash: &Sha1Hash) -> bool {
        self.inner.contains(hash)
    }

    fn materialize(&self, hash: &Sha1Hash, destination: &Path) -> Result<(), PoolError> {
        self.materialized.fetch_add(1, Ordering::SeqCst);
        self.inner.materialize(hash, destination)
    }

    fn add_file(&self, path: &Path) -> Result<Option<Sha1Hash>, PoolError> {
        self.inner.add_file(path)
    }
}

/// Writes a zip archive with the given files.
pub fn write_zip(path: &Path, files: &[(&str, Vec<u8>)]) {
    let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, content) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes a zip archive that contains a symlink entry.
pub fn write_zip_with_symlink(path: &Path, link: &str, target: &str, files: &[(&str, Vec<u8>)]) {
    let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    writer
        .add_symlink(link, target, SimpleFileOptions::default())
        .unwrap();
    for (name, content) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes a deflated zip whose headers claim `content` is only `declared` bytes long.
pub fn write_understated_zip(path: &Path, name: &str, content: &[u8], declared: u32) {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(
            name,
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated),
        )
        .unwrap();
    writer.write_all(content).unwrap();
    let mut bytes = writer.finish().unwrap().into_inner();

    // The uncompressed size lives at offset 22 of the local file header and at offset 24 of the
    // central directory header.
    let central = bytes.windows(4).rposition(|w| w == b"PK\x01\x02").unwrap();
    for offset in [22, central + 24] {
        bytes[offset..offset + 4].copy_from_slice(&declared.to_le_bytes());
    }
    std::fs::write(path, bytes).unwrap();
}

/// `count` files of `size` bytes each.
pub fn files(count: usize, size: usize) -> Vec<(String, Vec<u8>)> {
    (0..count)
        .map(|index| (format!("file-{index}.txt"), vec![b'a' + (index % 26) as u8; size]))
        .collect()
}

pub fn as_entries(files: &[(String, Vec<u8>)]) -> Vec<(&str, Vec<u8>)> {
    files
        .iter()
        .map(|(name, content)| (name.as_str(), content.clone()))
        .collect()
}

/// All paths below `root`, relative to it, sorted.
pub fn tree(root: &Path) -> Vec<String> {
    let mut paths: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            entry
                .unwrap()
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    paths.sort();
    paths
}
