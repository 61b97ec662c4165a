//! Backend session: owns at most one live backend handle plus the encryption gate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::backend::{BackendFactory, BackendHandle};
use crate::encryption::EncryptionModule;
use crate::error::{RemoteError, Result};
use crate::queue::{LocalFile, WorkItem};

enum SessionState {
    Disconnected,
    Connected(BackendHandle),
}

/// Connection state for the worker.
///
/// Only the worker task holds a session. A handle that failed is closed and
/// dropped; the next [`ensure`](BackendSession::ensure) builds a fresh one.
pub struct BackendSession {
    factory: Arc<dyn BackendFactory>,
    state: SessionState,
    encryption: Option<Arc<dyn EncryptionModule>>,
}

impl BackendSession {
    /// Create a disconnected session.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        encryption: Option<Arc<dyn EncryptionModule>>,
    ) -> Self {
        Self {
            factory,
            state: SessionState::Disconnected,
            encryption,
        }
    }

    /// Create a session around an already constructed handle.
    pub fn connected(
        factory: Arc<dyn BackendFactory>,
        handle: BackendHandle,
        encryption: Option<Arc<dyn EncryptionModule>>,
    ) -> Self {
        Self {
            factory,
            state: SessionState::Connected(handle),
            encryption,
        }
    }

    /// Whether a live handle is held.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    /// Return the live handle, creating one if needed.
    pub fn ensure(&mut self) -> Result<&mut BackendHandle> {
        if let SessionState::Disconnected = self.state {
            let handle = self.factory.create().map_err(|e| match e {
                RemoteError::BackendConstruction(_) => e,
                other => RemoteError::BackendConstruction(other.to_string()),
            })?;
            debug!(
                backend = handle.display_name(),
                capability = handle.capability(),
                "backend instance created"
            );
            self.state = SessionState::Connected(handle);
        }
        match &mut self.state {
            SessionState::Connected(handle) => Ok(handle),
            SessionState::Disconnected => Err(RemoteError::BackendConstruction(
                "backend handle unavailable".to_string(),
            )),
        }
    }

    /// Close and drop the live handle. Close failures are logged, never returned.
    pub async fn invalidate(&mut self) {
        if let SessionState::Connected(mut handle) =
            std::mem::replace(&mut self.state, SessionState::Disconnected)
        {
            if let Err(e) = handle.close().await {
                warn!(
                    backend = handle.display_name(),
                    error = %e,
                    "failed to dispose backend instance"
                );
            }
        }
    }

    /// Encrypt the item's upload source in place, unless it already is.
    ///
    /// The ciphertext lands next to the source as `<path>.<extension>` and
    /// replaces it; size and hash are cleared so they get recomputed.
    pub async fn encrypt_if_needed(&mut self, item: &mut WorkItem) -> Result<()> {
        let Some(module) = self.encryption.clone() else {
            return Ok(());
        };
        if item.encrypted {
            return Ok(());
        }
        let Some(source) = item.local_file.as_ref() else {
            return Err(RemoteError::Config(format!(
                "no local file for upload of {}",
                item.remote_name
            )));
        };

        let src = source.path();
        let mut target = src.clone().into_os_string();
        target.push(".");
        target.push(module.file_extension());
        let dst = PathBuf::from(target);
        // Owned from here so a failed encryption does not leave a partial file behind.
        let dst = TempPath::try_from_path(dst)?;

        let (src_for_task, dst_for_task) = (src.clone(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || module.encrypt(&src_for_task, &dst_for_task))
            .await
            .map_err(|e| RemoteError::Cryptographic(e.to_string()))??;

        debug!(name = %item.remote_name, source = %src.display(), "volume encrypted");
        item.local_file = Some(LocalFile::Owned(dst));
        item.size = None;
        item.hash = None;
        item.encrypted = true;
        Ok(())
    }

    /// Decrypt a downloaded file into a new temporary file.
    ///
    /// Any failure, I/O included, is reported as [`RemoteError::Cryptographic`].
    pub async fn decrypt_after_get(&mut self, file: TempPath) -> Result<TempPath> {
        let Some(module) = self.encryption.clone() else {
            return Ok(file);
        };
        let plain = tempfile::NamedTempFile::new()
            .map_err(|e| RemoteError::Cryptographic(e.to_string()))?
            .into_temp_path();

        let (src, dst) = (file.to_path_buf(), plain.to_path_buf());
        let result = tokio::task::spawn_blocking(move || module.decrypt(&src, &dst))
            .await
            .map_err(|e| RemoteError::Cryptographic(e.to_string()))?;
        drop(file);

        match result {
            Ok(()) => Ok(plain),
            Err(RemoteError::Cryptographic(msg)) => Err(RemoteError::Cryptographic(msg)),
            Err(other) => Err(RemoteError::Cryptographic(other.to_string())),
        }
    }
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("connected", &self.is_connected())
            .field("encrypted", &self.encryption.is_some())
            .finish()
    }
}

/// Size and base64 SHA-256 of a local file.
pub async fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, STANDARD.encode(hasher.finalize())))
}
