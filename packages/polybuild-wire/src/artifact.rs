//! Content-addressed identifiers for build artifacts and action cache entries.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{instrument, trace};

/// The key to a content-addressed artifact.
///
/// An `ArtifactId` is the blake3 hash of either the raw bytes of an artifact
/// (when used as a CAS key) or a set of input fingerprints (when used as an
/// action cache key). Both cases use the same 32-byte hash representation, so
/// they share this type rather than minting two near-identical ones.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct ArtifactId(Vec<u8>);

impl ArtifactId {
    /// View the id as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Attempt to parse the id from a hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = bytes.len();
        trace!(?bytes, ?len, "decoded hex");
        if len != 32 {
            bail!("invalid hash length");
        }
        Ok(Self(bytes))
    }

    /// View the id as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse an id from raw bytes (the inverse of `as_bytes`).
    ///
    /// Used when deserializing ids from the metadata index or other binary
    /// formats. The bytes must be exactly 32 bytes (a blake3 hash).
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != 32 {
            bail!("invalid hash length: expected 32 bytes, got {len}");
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Create an id from a blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(hash.as_bytes().to_vec())
    }

    /// Hash the contents of a buffer to create an id.
    ///
    /// This computes the blake3 hash of the provided buffer. Use this when
    /// you have file contents or other data that you want to content-address.
    /// This is NOT for parsing ids that are already in binary format: use
    /// `from_bytes` for that.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer);
        let hash = hasher.finalize();
        Self::from_blake3(hash)
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Used to combine multiple fingerprints (e.g. a target's sources, its
    /// dependencies' artifact ids, and its command line) into a single action
    /// cache key.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        let hash = hasher.finalize();
        Self::from_blake3(hash)
    }
}

impl From<&ArtifactId> for ArtifactId {
    fn from(id: &ArtifactId) -> Self {
        id.clone()
    }
}

impl PartialEq<blake3::Hash> for ArtifactId {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<blake3::Hash> for &ArtifactId {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.0 == other.as_bytes()
    }
}

impl Serialize for ArtifactId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_hex() {
        let id = ArtifactId::from_buffer(b"hello world");
        let hex = id.to_hex();
        let parsed = ArtifactId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_short_hash() {
        assert!(ArtifactId::from_bytes([0u8; 16]).is_err());
    }

    #[test]
    fn fields_are_order_sensitive() {
        let a = ArtifactId::from_fields([b"a".as_slice(), b"b".as_slice()]);
        let b = ArtifactId::from_fields([b"b".as_slice(), b"a".as_slice()]);
        assert_ne!(a, b);
    }
}
