//! Content-addressed metadata blobs.
//!
//! A metadata map is serialized to compact JSON with its keys in sorted order,
//! so the same logical map always produces the same blob and hash regardless of
//! how the caller built it.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{RemoteError, Result};

/// Digest algorithms accepted by [`MetadataHash::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// BLAKE3 (32-byte output)
    Blake3,
}

impl HashAlgorithm {
    /// Resolve an algorithm by name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            _ => Err(RemoteError::UnsupportedAlgorithm(name.to_string())),
        }
    }

    /// Digest `data` and return the raw bytes.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }
}

/// Immutable metadata blob with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHash {
    hash: String,
    size: u64,
    blob: Vec<u8>,
    values: BTreeMap<String, String>,
}

impl MetadataHash {
    /// Canonicalize `values` and hash the resulting blob with `algorithm`.
    pub fn wrap<I, K, V>(values: I, algorithm: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let algo = HashAlgorithm::from_name(algorithm)?;
        let values: BTreeMap<String, String> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let blob = serde_json::to_vec(&values)?;
        Ok(Self::from_parts(algo, blob, values))
    }

    /// Rebuild a value from a previously stored blob.
    pub fn from_blob(blob: &[u8], algorithm: &str) -> Result<Self> {
        let algo = HashAlgorithm::from_name(algorithm)?;
        let values: BTreeMap<String, String> = serde_json::from_slice(blob)?;
        // Re-encode so a blob written with a different key order still hashes canonically.
        let blob = serde_json::to_vec(&values)?;
        Ok(Self::from_parts(algo, blob, values))
    }

    fn from_parts(algo: HashAlgorithm, blob: Vec<u8>, values: BTreeMap<String, String>) -> Self {
        let hash = STANDARD.encode(algo.digest(&blob));
        Self {
            hash,
            size: blob.len() as u64,
            blob,
            values,
        }
    }

    /// Base64-encoded digest of the blob.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Blob length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Canonical UTF-8 JSON encoding of the values.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// The metadata entries in key order.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}
