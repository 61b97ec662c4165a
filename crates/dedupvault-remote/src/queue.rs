//! Work items and the FIFO operation queue between producers and the worker.
//!
//! The queue is a thin layer over `tokio::sync::mpsc`. Completing it closes the
//! receiving half: producers blocked on capacity get their item back, items
//! already buffered can still be drained by the worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::sync::{mpsc, oneshot};

use crate::backend::RemoteEntry;
use crate::error::Result;

/// What a work item asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Upload a local file.
    Put,
    /// Download a remote file.
    Get,
    /// List the remote folder.
    List,
    /// Delete a remote file.
    Delete,
    /// Create the remote folder.
    CreateFolder,
    /// Stop accepting work; the worker exits after draining.
    Terminate,
    /// No-op that completes once everything queued before it has run.
    Barrier,
}

impl OperationKind {
    /// Label used in logs and the remote audit trail.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Put => "put",
            OperationKind::Get => "get",
            OperationKind::List => "list",
            OperationKind::Delete => "delete",
            OperationKind::CreateFolder => "createfolder",
            OperationKind::Terminate => "terminate",
            OperationKind::Barrier => "barrier",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secondary volume (for example an index) that is finalized with the
/// primary volume's hash and size right before the primary is uploaded.
pub trait AuxiliaryArtifact: Send {
    /// Remote name the artifact is uploaded under.
    fn remote_name(&self) -> &str;

    /// Local file holding the artifact's contents.
    fn local_path(&self) -> &Path;

    /// Record the primary volume's hash and size and close the file.
    fn finish(&mut self, primary_hash: &str, primary_size: u64) -> Result<()>;
}

/// Shared handle to an [`AuxiliaryArtifact`].
///
/// The primary upload finalizes the artifact and the artifact's own upload
/// reads its file; both hold this handle, and the artifact is dropped with the
/// last one.
#[derive(Clone)]
pub struct ShadowVolume(Arc<Mutex<Box<dyn AuxiliaryArtifact>>>);

impl ShadowVolume {
    /// Wrap an artifact.
    pub fn new(artifact: Box<dyn AuxiliaryArtifact>) -> Self {
        Self(Arc::new(Mutex::new(artifact)))
    }

    /// Remote name of the artifact.
    pub fn remote_name(&self) -> String {
        self.0.lock().remote_name().to_string()
    }

    /// Local path of the artifact.
    pub fn local_path(&self) -> PathBuf {
        self.0.lock().local_path().to_path_buf()
    }

    /// Finalize the artifact with the primary volume's hash and size.
    pub fn finish(&self, primary_hash: &str, primary_size: u64) -> Result<()> {
        self.0.lock().finish(primary_hash, primary_size)
    }
}

impl std::fmt::Debug for ShadowVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShadowVolume").field(&self.remote_name()).finish()
    }
}

/// Source file of an upload.
#[derive(Debug)]
pub enum LocalFile {
    /// Temporary file deleted when the item is dropped.
    Owned(TempPath),
    /// File owned by the caller, left in place.
    Borrowed(PathBuf),
    /// File belonging to a shadow artifact.
    Shadow(ShadowVolume),
}

impl LocalFile {
    /// Filesystem path of the file.
    pub fn path(&self) -> PathBuf {
        match self {
            LocalFile::Owned(p) => p.to_path_buf(),
            LocalFile::Borrowed(p) => p.clone(),
            LocalFile::Shadow(s) => s.local_path(),
        }
    }
}

/// A downloaded, verified and decrypted volume.
#[derive(Debug)]
pub struct DownloadedVolume {
    /// Plaintext file; deleted when dropped.
    pub file: TempPath,
    /// Hash of the downloaded (still encrypted) bytes, unless checks were skipped.
    pub hash: Option<String>,
    /// Size of the downloaded (still encrypted) bytes.
    pub size: u64,
}

/// Successful outcome of a work item.
#[derive(Debug)]
pub enum OperationOutput {
    /// Put, Delete, CreateFolder, Terminate, Barrier and verify-only Get.
    Done,
    /// Remote listing.
    Listing(Vec<RemoteEntry>),
    /// Downloaded volume.
    Downloaded(DownloadedVolume),
}

/// Receiving side of a work item's completion signal.
pub type Completion = oneshot::Receiver<Result<OperationOutput>>;

/// One unit of work for the worker.
pub struct WorkItem {
    /// Operation.
    pub kind: OperationKind,
    /// Remote file name (empty for List, Terminate and Barrier).
    pub remote_name: String,
    /// Upload source.
    pub local_file: Option<LocalFile>,
    /// Expected (Get) or computed (Put) size.
    pub size: Option<u64>,
    /// Expected (Get) or computed (Put) base64 SHA-256.
    pub hash: Option<String>,
    /// Whether `local_file` already holds ciphertext.
    pub encrypted: bool,
    /// Artifact finalized before this Put runs.
    pub shadow: Option<ShadowVolume>,
    /// Write state changes to the volume tracker.
    pub tracked: bool,
    /// Get that verifies the download and discards it.
    pub verify_only: bool,
    completion: oneshot::Sender<Result<OperationOutput>>,
}

impl WorkItem {
    /// Build an item and the receiver its outcome is delivered on.
    pub fn new(kind: OperationKind, remote_name: impl Into<String>) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let item = Self {
            kind,
            remote_name: remote_name.into(),
            local_file: None,
            size: None,
            hash: None,
            encrypted: false,
            shadow: None,
            tracked: true,
            verify_only: false,
            completion: tx,
        };
        (item, rx)
    }

    /// Upload source.
    pub fn with_local_file(mut self, file: LocalFile) -> Self {
        self.local_file = Some(file);
        self
    }

    /// Expected size and hash.
    pub fn with_expected(mut self, size: Option<u64>, hash: Option<String>) -> Self {
        self.size = size;
        self.hash = hash;
        self
    }

    /// Deliver the outcome. A producer that stopped waiting is ignored.
    ///
    /// The item's local files are released before the producer is woken.
    pub fn complete(self, result: Result<OperationOutput>) {
        let WorkItem {
            completion,
            local_file,
            shadow,
            ..
        } = self;
        drop(local_file);
        drop(shadow);
        let _ = completion.send(result);
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.kind)
            .field("remote_name", &self.remote_name)
            .field("size", &self.size)
            .field("encrypted", &self.encrypted)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum QueueSender {
    Bounded(mpsc::Sender<WorkItem>),
    Unbounded(mpsc::UnboundedSender<WorkItem>),
}

enum QueueReceiverInner {
    Bounded(mpsc::Receiver<WorkItem>),
    Unbounded(mpsc::UnboundedReceiver<WorkItem>),
}

/// Producer side of the queue.
#[derive(Clone)]
pub struct OperationQueue {
    tx: QueueSender,
}

/// Worker side of the queue.
pub struct QueueReceiver {
    rx: QueueReceiverInner,
}

/// Create a queue holding at most `capacity` items, `None` meaning unbounded.
pub fn operation_queue(capacity: Option<usize>) -> (OperationQueue, QueueReceiver) {
    match capacity {
        Some(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (
                OperationQueue {
                    tx: QueueSender::Bounded(tx),
                },
                QueueReceiver {
                    rx: QueueReceiverInner::Bounded(rx),
                },
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                OperationQueue {
                    tx: QueueSender::Unbounded(tx),
                },
                QueueReceiver {
                    rx: QueueReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}

impl OperationQueue {
    /// Append an item, waiting while the queue is full.
    ///
    /// Hands the item back if the queue has been completed, including while
    /// this call was waiting for capacity.
    pub async fn enqueue(&self, item: WorkItem) -> std::result::Result<(), WorkItem> {
        match &self.tx {
            QueueSender::Bounded(tx) => tx.send(item).await.map_err(|e| e.0),
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|e| e.0),
        }
    }

    /// Whether the queue no longer accepts items.
    pub fn is_completed(&self) -> bool {
        match &self.tx {
            QueueSender::Bounded(tx) => tx.is_closed(),
            QueueSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl QueueReceiver {
    /// Next item in FIFO order; `None` once completed (or abandoned) and empty.
    pub async fn dequeue(&mut self) -> Option<WorkItem> {
        match &mut self.rx {
            QueueReceiverInner::Bounded(rx) => rx.recv().await,
            QueueReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Stop accepting items. Idempotent.
    pub fn complete(&mut self) {
        match &mut self.rx {
            QueueReceiverInner::Bounded(rx) => rx.close(),
            QueueReceiverInner::Unbounded(rx) => rx.close(),
        }
    }

    /// Complete the queue and take every item still buffered.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        self.complete();
        let mut items = Vec::new();
        loop {
            let next = match &mut self.rx {
                QueueReceiverInner::Bounded(rx) => rx.try_recv().ok(),
                QueueReceiverInner::Unbounded(rx) => rx.try_recv().ok(),
            };
            match next {
                Some(item) => items.push(item),
                None => return items,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(name: &str) -> (WorkItem, Completion) {
        WorkItem::new(OperationKind::Put, name)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (q, mut rx) = operation_queue(Some(8));
        for name in ["a", "b", "c"] {
            q.enqueue(item(name).0).await.unwrap();
        }
        assert_eq!(rx.dequeue().await.unwrap().remote_name, "a");
        assert_eq!(rx.dequeue().await.unwrap().remote_name, "b");
        assert_eq!(rx.dequeue().await.unwrap().remote_name, "c");
    }

    #[tokio::test]
    async fn test_completed_queue_rejects() {
        let (q, mut rx) = operation_queue(None);
        rx.complete();
        assert!(q.is_completed());
        let rejected = q.enqueue(item("late").0).await.unwrap_err();
        assert_eq!(rejected.remote_name, "late");
    }

    #[tokio::test]
    async fn test_complete_wakes_blocked_producer() {
        let (q, mut rx) = operation_queue(Some(1));
        q.enqueue(item("first").0).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(item("second").0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let drained = rx.drain();
        assert_eq!(drained.len(), 1);
        let rejected = producer.await.unwrap().unwrap_err();
        assert_eq!(rejected.remote_name, "second");
    }

    #[tokio::test]
    async fn test_drained_items_can_still_be_signalled() {
        let (q, mut rx) = operation_queue(Some(4));
        let (a, done_a) = item("a");
        q.enqueue(a).await.unwrap();
        for pending in rx.drain() {
            pending.complete(Err(crate::error::RemoteError::Cancelled));
        }
        assert!(matches!(
            done_a.await.unwrap(),
            Err(crate::error::RemoteError::Cancelled)
        ));
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_item_closes_completion() {
        let (a, done) = item("a");
        drop(a);
        assert!(done.await.is_err());
    }

    #[test]
    fn test_local_file_paths() {
        let borrowed = LocalFile::Borrowed(PathBuf::from("/tmp/x"));
        assert_eq!(borrowed.path(), PathBuf::from("/tmp/x"));
        assert_eq!(OperationKind::CreateFolder.to_string(), "createfolder");
    }
}
