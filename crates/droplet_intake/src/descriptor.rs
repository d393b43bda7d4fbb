//! Fingerprints of files the client expects to be copied out of the resource pool.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use droplet_digest::{serde::SerializableHash, Sha1, Sha1Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

/// Declares that the pool entry with hash `sha1` must be materialized at `path` inside the sandbox.
///
/// The serialized form is the fingerprint object clients send along with an upload:
///
/// ```json
/// {"sha1": "943a702d06f34599aee1f8da8ef9f7296031d699", "fn": "app/index.php", "mode": "644"}
/// ```
///
/// `path` is untrusted and is only ever used after it has been resolved by a
/// [`crate::PathGuard`].
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde_as(as = "SerializableHash::<Sha1>")]
    pub sha1: Sha1Hash,

    /// Destination relative to the sandbox root.
    #[serde(rename = "fn")]
    pub path: String,

    /// The size the client claims the file has. Informational only, the quota is always computed
    /// from the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Permission bits for the materialized file. Defaults to [`FileMode::DEFAULT`].
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FileMode>,
}

impl ResourceDescriptor {
    pub fn new(sha1: Sha1Hash, path: impl Into<String>) -> Self {
        Self {
            sha1,
            path: path.into(),
            size: None,
            mode: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// The destination as a path relative to the sandbox root.
    pub fn destination(&self) -> &Path {
        Path::new(&self.path)
    }

    /// The mode the materialized file receives.
    pub fn effective_mode(&self) -> FileMode {
        self.mode.unwrap_or(FileMode::DEFAULT)
    }
}

/// Unix permission bits, exchanged as an octal string such as `"644"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub const DEFAULT: FileMode = FileMode(0o644);

    /// Returns `None` if `bits` has anything set besides the permission and special bits.
    pub fn new(bits: u32) -> Option<Self> {
        (bits <= 0o7777).then_some(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Files copied into the sandbox must stay readable and writable by their owner, otherwise
    /// later stages cannot process them.
    pub fn grants_owner_read_write(self) -> bool {
        self.0 & 0o600 == 0o600
    }
}

impl Default for FileMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// An error returned when a string is not a valid octal file mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid octal file mode")]
pub struct ParseFileModeError(String);

impl FromStr for FileMode {
    type Err = ParseFileModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.starts_with(['+', '-']) {
            return Err(ParseFileModeError(s.to_string()));
        }
        u32::from_str_radix(trimmed, 8)
            .ok()
            .and_then(FileMode::new)
            .ok_or_else(|| ParseFileModeError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droplet_digest::compute_bytes_digest;
    use rstest::rstest;

    #[rstest]
    #[case("644", 0o644)]
    #[case("0644", 0o644)]
    #[case("755", 0o755)]
    #[case("600", 0o600)]
    #[case("4755", 0o4755)]
    fn test_parse_mode(#[case] input: &str, #[case] expected: u32) {
        assert_eq!(input.parse::<FileMode>().unwrap().bits(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("rw-r--r--")]
    #[case("899")]
    #[case("-644")]
    #[case("17777")]
    fn test_parse_invalid_mode(#[case] input: &str) {
        assert!(input.parse::<FileMode>().is_err());
    }

    #[rstest]
    #[case(0o644, true)]
    #[case(0o600, true)]
    #[case(0o777, true)]
    #[case(0o444, false)]
    #[case(0o200, false)]
    #[case(0o000, false)]
    fn test_owner_read_write(#[case] bits: u32, #[case] expected: bool) {
        assert_eq!(FileMode::new(bits).unwrap().grants_owner_read_write(), expected);
    }

    #[test]
    fn test_deserialize_fingerprint() {
        let descriptor: ResourceDescriptor = serde_json::from_str(
            r#"{"sha1":"943a702d06f34599aee1f8da8ef9f7296031d699","fn":"app/index.php","size":13,"mode":"755"}"#,
        )
        .unwrap();

        assert_eq!(descriptor.sha1, compute_bytes_digest::<Sha1>("Hello, world!"));
        assert_eq!(descriptor.destination(), Path::new("app/index.php"));
        assert_eq!(descriptor.size, Some(13));
        assert_eq!(descriptor.effective_mode().bits(), 0o755);
    }

    #[test]
    fn test_optional_fields_default() {
        let descriptor: ResourceDescriptor = serde_json::from_str(
            r#"{"sha1":"943a702d06f34599aee1f8da8ef9f7296031d699","fn":"index.php"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.size, None);
        assert_eq!(descriptor.mode, None);
        assert_eq!(descriptor.effective_mode(), FileMode::DEFAULT);

        // Absent optional fields are not written back.
        assert_eq!(
            serde_json::to_string(&descriptor).unwrap(),
            r#"{"sha1":"943a702d06f34599aee1f8da8ef9f7296031d699","fn":"index.php"}"#
        );
    }

    #[test]
    fn test_serialize_mode_as_octal() {
        let descriptor = ResourceDescriptor::new(compute_bytes_digest::<Sha1>(""), "a.txt")
            .with_mode(FileMode::new(0o600).unwrap());
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["mode"], "600");
        assert_eq!(json["sha1"], "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_rejects_invalid_hash() {
        assert!(serde_json::from_str::<ResourceDescriptor>(r#"{"sha1":"abc","fn":"a"}"#).is_err());
    }
}
