//! Pluggable remote storage capability interfaces.
//!
//! A backend implementation is owned by exactly one session and is only ever
//! driven from the worker task, which is why every method takes `&mut self`
//! and the traits require `Send` but not `Sync`. Optional capabilities are
//! resolved once, when the factory builds a [`BackendHandle`].

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{RemoteError, Result};

/// One entry of a remote folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File name relative to the backend root.
    pub name: String,
    /// Size in bytes, if the backend reports it.
    pub size: Option<u64>,
    /// Last modification time, if the backend reports it.
    pub last_modified: Option<SystemTime>,
    /// Whether the entry is a folder.
    pub is_folder: bool,
}

impl RemoteEntry {
    /// A plain file entry with a known size.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size: Some(size),
            last_modified: None,
            is_folder: false,
        }
    }
}

/// Whole-file remote storage operations every backend provides.
#[async_trait]
pub trait RemoteBackend: Send {
    /// Short name used in logs.
    fn display_name(&self) -> &str;

    /// Upload the file at `local` as `name`.
    async fn put(&mut self, name: &str, local: &Path) -> Result<()>;

    /// Download `name` into the file at `local`, replacing its contents.
    async fn get(&mut self, name: &str, local: &Path) -> Result<()>;

    /// List the backend folder.
    async fn list(&mut self) -> Result<Vec<RemoteEntry>>;

    /// Delete `name`.
    async fn delete(&mut self, name: &str) -> Result<()>;

    /// Release connections held by this instance.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backends that can transfer through byte streams instead of local files.
#[async_trait]
pub trait StreamingBackend: RemoteBackend {
    /// Upload everything readable from `source` as `name`.
    async fn put_stream(
        &mut self,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    /// Write the contents of `name` into `sink`.
    async fn get_stream(
        &mut self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// Streaming backends that can also create their target folder.
#[async_trait]
pub trait FolderBackend: StreamingBackend {
    /// Create the backend's target folder.
    async fn create_folder(&mut self) -> Result<()>;
}

/// A live backend instance tagged with its capabilities.
pub enum BackendHandle {
    /// File-based transfers only.
    Basic(Box<dyn RemoteBackend>),
    /// Stream-based transfers.
    Streaming(Box<dyn StreamingBackend>),
    /// Stream-based transfers and folder creation.
    StreamingWithFolders(Box<dyn FolderBackend>),
}

impl BackendHandle {
    /// Short backend name used in logs.
    pub fn display_name(&self) -> &str {
        match self {
            BackendHandle::Basic(b) => b.display_name(),
            BackendHandle::Streaming(b) => b.display_name(),
            BackendHandle::StreamingWithFolders(b) => b.display_name(),
        }
    }

    /// Capability label used in logs.
    pub fn capability(&self) -> &'static str {
        match self {
            BackendHandle::Basic(_) => "basic",
            BackendHandle::Streaming(_) => "streaming",
            BackendHandle::StreamingWithFolders(_) => "streaming+folders",
        }
    }

    /// Whether stream transfers are available.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, BackendHandle::Basic(_))
    }

    /// Upload a local file.
    pub async fn put(&mut self, name: &str, local: &Path) -> Result<()> {
        match self {
            BackendHandle::Basic(b) => b.put(name, local).await,
            BackendHandle::Streaming(b) => b.put(name, local).await,
            BackendHandle::StreamingWithFolders(b) => b.put(name, local).await,
        }
    }

    /// Download into a local file.
    pub async fn get(&mut self, name: &str, local: &Path) -> Result<()> {
        match self {
            BackendHandle::Basic(b) => b.get(name, local).await,
            BackendHandle::Streaming(b) => b.get(name, local).await,
            BackendHandle::StreamingWithFolders(b) => b.get(name, local).await,
        }
    }

    /// List the backend folder.
    pub async fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        match self {
            BackendHandle::Basic(b) => b.list().await,
            BackendHandle::Streaming(b) => b.list().await,
            BackendHandle::StreamingWithFolders(b) => b.list().await,
        }
    }

    /// Delete a remote file.
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        match self {
            BackendHandle::Basic(b) => b.delete(name).await,
            BackendHandle::Streaming(b) => b.delete(name).await,
            BackendHandle::StreamingWithFolders(b) => b.delete(name).await,
        }
    }

    /// Release the backend's connections.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            BackendHandle::Basic(b) => b.close().await,
            BackendHandle::Streaming(b) => b.close().await,
            BackendHandle::StreamingWithFolders(b) => b.close().await,
        }
    }

    /// Upload from a stream; fails on backends without streaming support.
    pub async fn put_stream(
        &mut self,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        match self {
            BackendHandle::Basic(_) => Err(RemoteError::UnsupportedOperation(
                "streaming upload".to_string(),
            )),
            BackendHandle::Streaming(b) => b.put_stream(name, source).await,
            BackendHandle::StreamingWithFolders(b) => b.put_stream(name, source).await,
        }
    }

    /// Download into a stream; fails on backends without streaming support.
    pub async fn get_stream(
        &mut self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        match self {
            BackendHandle::Basic(_) => Err(RemoteError::UnsupportedOperation(
                "streaming download".to_string(),
            )),
            BackendHandle::Streaming(b) => b.get_stream(name, sink).await,
            BackendHandle::StreamingWithFolders(b) => b.get_stream(name, sink).await,
        }
    }

    /// Create the target folder; only `StreamingWithFolders` handles can.
    pub async fn create_folder(&mut self) -> Result<()> {
        match self {
            BackendHandle::StreamingWithFolders(b) => b.create_folder().await,
            other => Err(RemoteError::UnsupportedOperation(format!(
                "{} backend {} cannot create folders",
                other.capability(),
                other.display_name()
            ))),
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackendHandle({})", self.capability())
    }
}

/// Builds fresh backend instances for a session.
///
/// Called once up front to validate the target and again whenever the
/// session has discarded its handle after a failure.
pub trait BackendFactory: Send + Sync {
    /// Instantiate a backend.
    fn create(&self) -> Result<BackendHandle>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<BackendHandle> + Send + Sync,
{
    fn create(&self) -> Result<BackendHandle> {
        self()
    }
}
