//! Volume file encryption: AES-256-GCM and ChaCha20-Poly1305 AEAD with HKDF key derivation
//!
//! Encrypted file layout:
//!
//! ```text
//! magic "DVE1" | algo (1 byte) | salt (16 bytes) | nonce (12 bytes) | ciphertext + 16-byte tag
//! ```

use std::path::Path;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{RemoteError, Result};

const MAGIC: &[u8; 4] = b"DVE1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Encrypts and decrypts whole volume files.
///
/// Implementations run on the blocking thread pool, one file at a time.
pub trait EncryptionModule: Send + Sync {
    /// Suffix appended to encrypted file names, without the leading dot.
    fn file_extension(&self) -> &str;

    /// Encrypt the file at `src` into a new file at `dst`.
    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Decrypt the file at `src` into a new file at `dst`.
    ///
    /// Authentication failures must be reported as [`RemoteError::Cryptographic`].
    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, constant-time and fast on non-AES hardware
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm256 => 1,
            EncryptionAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(EncryptionAlgorithm::AesGcm256),
            2 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            other => Err(RemoteError::Cryptographic(format!(
                "unknown cipher tag {}",
                other
            ))),
        }
    }
}

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Secret-keyed AEAD encryption of volume files.
///
/// Per-file keys come from HKDF-SHA256 over the secret, which does no key
/// stretching: the secret must carry full key entropy, such as a generated
/// token or a key from [`from_key`](Self::from_key). A human-chosen password
/// has to go through a password KDF before it reaches this module.
pub struct AeadFileEncryption {
    secret: Zeroizing<Vec<u8>>,
    algo: EncryptionAlgorithm,
}

impl AeadFileEncryption {
    /// Create a module keyed by a high-entropy `passphrase` using `algo`.
    pub fn new(passphrase: &str, algo: EncryptionAlgorithm) -> Self {
        Self {
            secret: Zeroizing::new(passphrase.as_bytes().to_vec()),
            algo,
        }
    }

    /// Create a module keyed by raw key material.
    pub fn from_key(key: &EncryptionKey, algo: EncryptionAlgorithm) -> Self {
        Self {
            secret: Zeroizing::new(key.0.to_vec()),
            algo,
        }
    }

    /// Derive the per-file key from the secret and the file's salt using HKDF-SHA256
    fn derive_key(&self, salt: &[u8]) -> Result<EncryptionKey> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut okm = [0u8; 32];
        hk.expand(b"dedupvault-volume-key", &mut okm)
            .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
        Ok(EncryptionKey(okm))
    }

    /// Encrypt an in-memory buffer into the file layout.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);
        let key = self.derive_key(&salt)?;

        let ciphertext = match self.algo {
            EncryptionAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
                cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                use chacha20poly1305::aead::Aead as _;
                use chacha20poly1305::KeyInit as _;
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
                cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?
            }
        };

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(self.algo.tag());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a buffer produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
            return Err(RemoteError::Cryptographic(
                "not an encrypted volume (bad header)".to_string(),
            ));
        }
        let algo = EncryptionAlgorithm::from_tag(sealed[MAGIC.len()])?;
        let salt_start = MAGIC.len() + 1;
        let nonce_start = salt_start + SALT_LEN;
        let salt = &sealed[salt_start..nonce_start];
        let nonce = &sealed[nonce_start..HEADER_LEN];
        let ciphertext = &sealed[HEADER_LEN..];
        let key = self.derive_key(salt)?;

        let auth_failed = |_: aes_gcm::aead::Error| {
            RemoteError::Cryptographic("authentication tag mismatch (data may be corrupted)".to_string())
        };
        match algo {
            EncryptionAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                    .map_err(auth_failed)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                use chacha20poly1305::aead::Aead as _;
                use chacha20poly1305::KeyInit as _;
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                    .map_err(auth_failed)
            }
        }
    }
}

impl std::fmt::Debug for AeadFileEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadFileEncryption")
            .field("algo", &self.algo)
            .finish_non_exhaustive()
    }
}

impl EncryptionModule for AeadFileEncryption {
    fn file_extension(&self) -> &str {
        match self.algo {
            EncryptionAlgorithm::AesGcm256 => "aes",
            EncryptionAlgorithm::ChaCha20Poly1305 => "chacha",
        }
    }

    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let plaintext = Zeroizing::new(std::fs::read(src)?);
        let sealed = self.seal(&plaintext)?;
        std::fs::write(dst, sealed)?;
        Ok(())
    }

    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let sealed = std::fs::read(src)?;
        let plaintext = Zeroizing::new(self.open(&sealed)?);
        std::fs::write(dst, plaintext.as_slice())?;
        Ok(())
    }
}
