//! Serialization of digests as lowercase hex strings, the way fingerprints are exchanged with
//! clients.
//!
//! Use [`SerializableHash`] directly or as a `serde_with` adapter:
//!
//! ```
//! use droplet_digest::{serde::SerializableHash, Sha1, Sha1Hash};
//!
//! #[serde_with::serde_as]
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Fingerprint {
//!     #[serde_as(as = "SerializableHash::<Sha1>")]
//!     sha1: Sha1Hash,
//! }
//!
//! let fingerprint: Fingerprint =
//!     serde_json::from_str(r#"{"sha1":"943a702d06f34599aee1f8da8ef9f7296031d699"}"#).unwrap();
//! ```
use digest::{Digest, Output};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};
use std::borrow::Cow;
use std::fmt::LowerHex;
use std::ops::Deref;

/// Deserialize the [`Output`] of a [`Digest`] from a hex string.
pub fn deserialize<'de, D, Dig: Digest>(deserializer: D) -> Result<Output<Dig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str = Cow::<'de, str>::deserialize(deserializer)?;
    super::parse_digest_from_hex::<Dig>(str.as_ref())
        .ok_or_else(|| Error::custom(format!("'{str}' is not a valid hex encoded digest")))
}

/// Serializes the [`Output`] of a [`Digest`] as a lowercase hex string.
pub fn serialize<'a, S: Serializer, Dig: Digest>(
    digest: &'a Output<Dig>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    &'a Output<Dig>: LowerHex,
{
    format!("{digest:x}").serialize(s)
}

/// Wrapper type for serializing a hash as hex.
pub struct SerializableHash<T: Digest>(pub Output<T>);

impl<T: Digest> std::fmt::Debug for SerializableHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerializableHash({:x})", &self.0)
    }
}

impl<T: Digest> Serialize for SerializableHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize::<S, T>(&self.0, serializer)
    }
}

impl<'de, T: Digest> Deserialize<'de> for SerializableHash<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize::<D, T>(deserializer).map(SerializableHash)
    }
}

impl<T: Digest> Deref for SerializableHash<T> {
    type Target = Output<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Digest> SerializeAs<Output<T>> for SerializableHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize_as<S>(source: &Output<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize::<S, T>(source, serializer)
    }
}

impl<'de, T: Digest> DeserializeAs<'de, Output<T>> for SerializableHash<T> {
    fn deserialize_as<D>(deserializer: D) -> Result<Output<T>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize::<D, T>(deserializer)
    }
}
