use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The content address of a blob: a 32-byte Blake3 hash.
///
/// Keys identify build outputs, cached sources, and artifact store blobs.
/// Two blobs with the same key are assumed to have identical content; this
/// is a change-detection guarantee, not a cryptographic authentication one.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct Key([u8; 32]);

impl Key {
    /// View the key as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse the key from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        Self::from_bytes(bytes)
    }

    /// View the key as bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a key from raw bytes (the inverse of `as_bytes`).
    ///
    /// The bytes must be exactly 32 bytes (a Blake3 hash). This is NOT for
    /// hashing content: use [`Key::from_buffer`] for that.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != 32 {
            bail!("invalid hash length: expected 32 bytes, got {len}");
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Create a key from a Blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    /// Hash the contents of a buffer to create a key.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        Self::from_blake3(blake3::hash(buffer.as_ref()))
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Each field is fed to the hasher prefixed with its length so that
    /// `["ab", "c"]` and `["a", "bc"]` produce distinct keys.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self::from_blake3(hasher.finalize())
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        *key
    }
}

impl PartialEq<blake3::Hash> for Key {
    fn eq(&self, other: &blake3::Hash) -> bool {
        &self.0 == other.as_bytes()
    }
}

impl Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
