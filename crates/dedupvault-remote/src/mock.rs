//! In-memory backend for tests and local experimentation.
//!
//! Clones share the same file map, call log and failure switches, so a test
//! can keep one clone for inspection and hand others to a factory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::backend::{
    BackendFactory, BackendHandle, FolderBackend, RemoteBackend, RemoteEntry, StreamingBackend,
};
use crate::error::{RemoteError, Result};

/// Capability set a [`MemoryBackend`] factory advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCapability {
    /// Whole-file transfers.
    Basic,
    /// Stream transfers.
    Streaming,
    /// Stream transfers and folder creation.
    StreamingWithFolders,
}

/// Backend storing files in a shared map.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    fail_next: Arc<AtomicUsize>,
    fail_always: Arc<AtomicBool>,
    closes: Arc<AtomicU64>,
    folder_created: Arc<AtomicBool>,
    folder_required: Arc<AtomicBool>,
    discard_puts: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put, get, list and delete take one permit from `gate` first.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call until switched off.
    pub fn fail_always(&self, on: bool) {
        self.fail_always.store(on, Ordering::SeqCst);
    }

    /// Reject uploads with [`RemoteError::FolderMissing`] until `create_folder` runs.
    pub fn require_folder(&self, on: bool) {
        self.folder_required.store(on, Ordering::SeqCst);
    }

    /// Accept uploads without storing them.
    pub fn discard_puts(&self, on: bool) {
        self.discard_puts.store(on, Ordering::SeqCst);
    }

    /// Store a file directly.
    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.files.lock().insert(name.to_string(), data.into());
    }

    /// Contents of a stored file.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }

    /// Flip one byte of a stored file. Returns false if the file is missing or empty.
    pub fn corrupt(&self, name: &str, offset: usize) -> bool {
        let mut files = self.files.lock();
        match files.get_mut(name) {
            Some(data) if !data.is_empty() => {
                let at = offset.min(data.len() - 1);
                data[at] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    /// Stored file names in order.
    pub fn names(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }

    /// Calls seen so far, formatted as `op:name`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of times an instance was closed.
    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Whether `create_folder` has succeeded.
    pub fn folder_created(&self) -> bool {
        self.folder_created.load(Ordering::SeqCst)
    }

    /// Wrap a clone in a handle with the given capabilities.
    pub fn handle(&self, capability: MemoryCapability) -> BackendHandle {
        match capability {
            MemoryCapability::Basic => BackendHandle::Basic(Box::new(self.clone())),
            MemoryCapability::Streaming => BackendHandle::Streaming(Box::new(self.clone())),
            MemoryCapability::StreamingWithFolders => {
                BackendHandle::StreamingWithFolders(Box::new(self.clone()))
            }
        }
    }

    /// Factory producing handles onto this backend's shared state.
    pub fn factory(&self, capability: MemoryCapability) -> Arc<dyn BackendFactory> {
        let backend = self.clone();
        Arc::new(move || -> Result<BackendHandle> { Ok(backend.handle(capability)) })
    }

    async fn enter(&self, op: &str, name: &str) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(RemoteError::remote)?.forget();
        }
        self.calls.lock().push(format!("{}:{}", op, name));

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(RemoteError::remote(format!("injected failure on {}", op)));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(RemoteError::remote(format!("injected failure on {}", op)));
        }
        Ok(())
    }

    fn store(&self, name: &str, data: Vec<u8>) -> Result<()> {
        if self.folder_required.load(Ordering::SeqCst) && !self.folder_created() {
            return Err(RemoteError::FolderMissing(name.to_string()));
        }
        if !self.discard_puts.load(Ordering::SeqCst) {
            self.files.lock().insert(name.to_string(), data);
        }
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("files", &self.files.lock().len())
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn display_name(&self) -> &str {
        "memory"
    }

    async fn put(&mut self, name: &str, local: &Path) -> Result<()> {
        self.enter("put", name).await?;
        let data = tokio::fs::read(local).await?;
        debug!(name = %name, bytes = data.len(), "memory put");
        self.store(name, data)
    }

    async fn get(&mut self, name: &str, local: &Path) -> Result<()> {
        self.enter("get", name).await?;
        let data = self.read_file(name)?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        self.enter("list", "").await?;
        Ok(self
            .files
            .lock()
            .iter()
            .map(|(name, data)| RemoteEntry::file(name.clone(), data.len() as u64))
            .collect())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        self.enter("delete", name).await?;
        match self.files.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(name.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StreamingBackend for MemoryBackend {
    async fn put_stream(
        &mut self,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.enter("put", name).await?;
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.store(name, data)
    }

    async fn get_stream(
        &mut self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.enter("get", name).await?;
        let data = self.read_file(name)?;
        sink.write_all(&data).await?;
        sink.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl FolderBackend for MemoryBackend {
    async fn create_folder(&mut self) -> Result<()> {
        self.enter("createfolder", "").await?;
        self.folder_created.store(true, Ordering::SeqCst);
        Ok(())
    }
}
