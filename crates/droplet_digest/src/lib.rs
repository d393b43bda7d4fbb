#![deny(missing_docs)]

//! Helpers to compute the SHA-1 fingerprints that identify application files.
//!
//! Uploaded application bits are described by the SHA-1 hash of their content. The same hash
//! keys the resource pool and is recorded for every staged package. The functions in this crate
//! are generic over [`Digest`] so tests and callers can swap in other algorithms, but every
//! droplet crate uses [`Sha1`].
//!
//! # Examples
//!
//! ```no_run
//! use droplet_digest::{compute_bytes_digest, compute_file_digest, Sha1};
//!
//! let hash = compute_bytes_digest::<Sha1>("Hello, world!");
//! println!("SHA-1 hash: {:x}", hash);
//!
//! let hash = compute_file_digest::<Sha1>("index.php").unwrap();
//! println!("SHA-1 hash: {:x}", hash);
//! ```

#[cfg(feature = "serde")]
pub mod serde;

pub use digest;

use digest::{Digest, Output};
use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

pub use sha1::Sha1;

/// A type alias for the output of a SHA-1 hash.
pub type Sha1Hash = sha1::digest::Output<Sha1>;

/// Compute a hash of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Compute a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hash hex string to a digest. Returns `None` if the string is not valid hex or does not
/// have the length of the digest.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(()) => Some(hash),
        Err(_) => None,
    }
}

/// A [`Write`] implementation that hashes all bytes that pass through it. Call
/// [`HashingWriter::finalize`] to retrieve both the wrapped writer and the hash.
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: D::default(),
        }
    }
}

impl<W, D: Digest> HashingWriter<W, D> {
    /// Consumes this instance and returns the original writer and the hash of all bytes written to
    /// this instance.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A [`Read`] implementation that hashes all bytes read from it. Call
/// [`HashingReader::finalize`] to retrieve both the wrapped reader and the hash.
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: D::default(),
        }
    }
}

impl<R, D: Digest> HashingReader<R, D> {
    /// Consumes this instance and returns the original reader and the hash of all bytes read from
    /// this instance.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}
