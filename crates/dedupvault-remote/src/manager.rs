//! Producer-facing API of the remote backend pipeline.
//!
//! [`BackendManager`] turns calls into work items for the worker task and,
//! where the call is synchronous, waits for the outcome. Once the worker has
//! recorded a fatal error every call fails fast with it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendFactory, RemoteEntry};
use crate::config::BackendConfig;
use crate::encryption::EncryptionModule;
use crate::error::{RemoteError, Result};
use crate::metrics::BackendMetrics;
use crate::queue::{
    operation_queue, AuxiliaryArtifact, Completion, DownloadedVolume, LocalFile, OperationKind,
    OperationOutput, OperationQueue, QueueReceiver, ShadowVolume, WorkItem,
};
use crate::session::BackendSession;
use crate::volume::{RemoteVolumeState, VolumeStateTracker};
use crate::worker::{FatalSlot, Worker};

/// A finished volume ready for upload.
pub struct VolumeUpload {
    /// Remote name.
    pub remote_name: String,
    /// Local file; deleted once the upload item is done with it.
    pub file: TempPath,
    /// Secondary artifact finalized with this volume's hash and size, then uploaded after it.
    pub shadow: Option<Box<dyn AuxiliaryArtifact>>,
}

impl VolumeUpload {
    /// An upload without a shadow artifact.
    pub fn new(remote_name: impl Into<String>, file: TempPath) -> Self {
        Self {
            remote_name: remote_name.into(),
            file,
            shadow: None,
        }
    }

    /// Attach a shadow artifact.
    pub fn with_shadow(mut self, shadow: Box<dyn AuxiliaryArtifact>) -> Self {
        self.shadow = Some(shadow);
        self
    }
}

/// Outcome of [`BackendManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// The worker stopped within the timeout.
    Clean,
    /// The worker did not stop in time and was aborted.
    TimedOut,
    /// The worker panicked; the cause is the manager's fatal error.
    Failed,
}

fn fatal_or_cancelled(fatal: &FatalSlot) -> RemoteError {
    fatal.get().cloned().unwrap_or(RemoteError::Cancelled)
}

/// Error for a waiter whose completion was dropped unsignalled.
///
/// Waits for the worker task to exit first so that a panic has been recorded.
async fn worker_lost(fatal: &FatalSlot, exited: &watch::Receiver<bool>) -> RemoteError {
    let mut exited = exited.clone();
    let _ = exited.wait_for(|done| *done).await;
    fatal_or_cancelled(fatal)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown cause"
    }
}

/// Run the worker, recording a panic as the fatal error before the items it
/// held are dropped.
async fn supervise(
    worker: Worker,
    rx: QueueReceiver,
    stop: watch::Receiver<bool>,
    fatal: FatalSlot,
    exited: watch::Sender<bool>,
) -> Result<()> {
    let mut run = Box::pin(AssertUnwindSafe(worker.run(rx, stop)).catch_unwind());
    let result = match (&mut run).await {
        Ok(()) => Ok(()),
        Err(payload) => {
            let err = RemoteError::remote(format!(
                "backend worker panicked: {}",
                panic_message(payload.as_ref())
            ));
            error!(error = %err, "backend worker panicked");
            let _ = fatal.set(err.clone());
            Err(err)
        }
    };
    drop(run);
    let _ = exited.send(true);
    result
}

fn expect_download(name: &str, output: OperationOutput) -> Result<DownloadedVolume> {
    match output {
        OperationOutput::Downloaded(volume) => Ok(volume),
        other => Err(RemoteError::remote(format!(
            "unexpected result for download of {}: {:?}",
            name, other
        ))),
    }
}

/// Pending asynchronous download.
#[derive(Debug)]
pub struct DownloadHandle {
    remote_name: String,
    completion: Completion,
    fatal: FatalSlot,
    exited: watch::Receiver<bool>,
}

impl DownloadHandle {
    /// Remote name being downloaded.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Wait for the download and return the plaintext file.
    pub async fn wait(self) -> Result<TempPath> {
        self.wait_with_info().await.map(|v| v.file)
    }

    /// Wait for the download and return the file with its hash and size.
    pub async fn wait_with_info(self) -> Result<DownloadedVolume> {
        let output = match self.completion.await {
            Ok(result) => result?,
            Err(_) => return Err(worker_lost(&self.fatal, &self.exited).await),
        };
        expect_download(&self.remote_name, output)
    }
}

/// Serialized access to one remote backend.
pub struct BackendManager {
    queue: OperationQueue,
    config: BackendConfig,
    tracker: Arc<dyn VolumeStateTracker>,
    metrics: Arc<BackendMetrics>,
    fatal: FatalSlot,
    stop: watch::Sender<bool>,
    exited: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    shutdown_status: OnceCell<ShutdownStatus>,
}

impl BackendManager {
    /// Validate the configuration and backend, then start the worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        config: BackendConfig,
        encryption: Option<Arc<dyn EncryptionModule>>,
        tracker: Arc<dyn VolumeStateTracker>,
        metrics: Arc<BackendMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RemoteError::Config(format!("no tokio runtime: {}", e)))?;

        let handle = factory.create().map_err(|e| match e {
            RemoteError::BackendConstruction(_) => e,
            other => RemoteError::BackendConstruction(other.to_string()),
        })?;
        info!(
            backend = handle.display_name(),
            capability = handle.capability(),
            encrypted = encryption.is_some(),
            capacity = ?config.queue_capacity(),
            "starting backend manager"
        );

        let session = BackendSession::connected(factory, handle, encryption);
        let (queue, rx) = operation_queue(config.queue_capacity());
        let (stop, stop_rx) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(false);
        let fatal: FatalSlot = Arc::new(OnceLock::new());
        let worker = Worker::new(
            session,
            config.clone(),
            Arc::clone(&tracker),
            Arc::clone(&metrics),
            Arc::clone(&fatal),
        );
        let task = runtime.spawn(supervise(
            worker,
            rx,
            stop_rx,
            Arc::clone(&fatal),
            exited_tx,
        ));

        Ok(Self {
            queue,
            config,
            tracker,
            metrics,
            fatal,
            stop,
            exited,
            worker: Mutex::new(Some(task)),
            shutdown_status: OnceCell::new(),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Shared statistics.
    pub fn metrics(&self) -> Arc<BackendMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Volume tracker the worker writes to.
    pub fn tracker(&self) -> Arc<dyn VolumeStateTracker> {
        Arc::clone(&self.tracker)
    }

    /// The sticky fatal error, if the worker has failed.
    pub fn fatal_error(&self) -> Option<RemoteError> {
        self.fatal.get().cloned()
    }

    fn check(&self) -> Result<()> {
        match self.fatal.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.check()?;
        match self.queue.enqueue(item).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                debug!(operation = %rejected.kind, name = %rejected.remote_name, "queue completed, item rejected");
                Err(fatal_or_cancelled(&self.fatal))
            }
        }
    }

    async fn wait(&self, completion: Completion) -> Result<OperationOutput> {
        let output = match completion.await {
            Ok(result) => result?,
            Err(_) => return Err(worker_lost(&self.fatal, &self.exited).await),
        };
        self.check()?;
        Ok(output)
    }

    async fn submit_put(&self, item: WorkItem, completion: Completion) -> Result<()> {
        self.enqueue(item).await?;
        if !self.config.asynchronous_upload {
            self.wait(completion).await?;
        }
        self.check()
    }

    /// Upload a volume, then its shadow artifact.
    ///
    /// Waits for each upload unless asynchronous upload is enabled.
    pub async fn put(&self, upload: VolumeUpload) -> Result<()> {
        self.check()?;
        let VolumeUpload {
            remote_name,
            file,
            shadow,
        } = upload;
        let shadow = shadow.map(ShadowVolume::new);

        self.tracker
            .update_remote_volume(&remote_name, RemoteVolumeState::Uploading, None, None);
        let (item, done) = WorkItem::new(OperationKind::Put, remote_name);
        let mut item = item.with_local_file(LocalFile::Owned(file));
        item.shadow = shadow.clone();
        self.submit_put(item, done).await?;

        if let Some(shadow) = shadow {
            let name = shadow.remote_name();
            self.tracker
                .update_remote_volume(&name, RemoteVolumeState::Uploading, None, None);
            let (item, done) = WorkItem::new(OperationKind::Put, name);
            let item = item.with_local_file(LocalFile::Shadow(shadow));
            self.submit_put(item, done).await?;
        }
        Ok(())
    }

    /// Upload a caller-owned file as is: no encryption, no volume tracking.
    pub async fn put_unencrypted(&self, remote_name: &str, path: PathBuf) -> Result<()> {
        let (item, done) = WorkItem::new(OperationKind::Put, remote_name);
        let mut item = item.with_local_file(LocalFile::Borrowed(path));
        item.encrypted = true;
        item.tracked = false;
        self.submit_put(item, done).await
    }

    /// Download, verify and decrypt a volume.
    pub async fn get(
        &self,
        remote_name: &str,
        size: Option<u64>,
        hash: Option<String>,
    ) -> Result<TempPath> {
        self.get_with_info(remote_name, size, hash)
            .await
            .map(|v| v.file)
    }

    /// Like [`get`](Self::get), also returning the downloaded hash and size.
    pub async fn get_with_info(
        &self,
        remote_name: &str,
        size: Option<u64>,
        hash: Option<String>,
    ) -> Result<DownloadedVolume> {
        let (item, done) = WorkItem::new(OperationKind::Get, remote_name);
        self.enqueue(item.with_expected(size, hash)).await?;
        let output = self.wait(done).await?;
        expect_download(remote_name, output)
    }

    /// Queue a download and return without waiting for it.
    pub async fn get_async(
        &self,
        remote_name: &str,
        size: Option<u64>,
        hash: Option<String>,
    ) -> Result<DownloadHandle> {
        let (item, done) = WorkItem::new(OperationKind::Get, remote_name);
        self.enqueue(item.with_expected(size, hash)).await?;
        Ok(DownloadHandle {
            remote_name: remote_name.to_string(),
            completion: done,
            fatal: Arc::clone(&self.fatal),
            exited: self.exited.clone(),
        })
    }

    /// Download a volume only to check its size and hash.
    pub async fn get_for_testing(
        &self,
        remote_name: &str,
        size: Option<u64>,
        hash: &str,
    ) -> Result<()> {
        if hash.is_empty() {
            return Err(RemoteError::Config(format!(
                "a hash is required to test {}",
                remote_name
            )));
        }
        let (item, done) = WorkItem::new(OperationKind::Get, remote_name);
        let mut item = item.with_expected(size, Some(hash.to_string()));
        item.verify_only = true;
        self.enqueue(item).await?;
        self.wait(done).await.map(|_| ())
    }

    /// List the remote folder.
    pub async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let (item, done) = WorkItem::new(OperationKind::List, "");
        self.enqueue(item).await?;
        match self.wait(done).await? {
            OperationOutput::Listing(entries) => Ok(entries),
            other => Err(RemoteError::remote(format!(
                "unexpected result for list: {:?}",
                other
            ))),
        }
    }

    /// Delete a remote volume, marking it Deleting first.
    pub async fn delete(
        &self,
        remote_name: &str,
        size: Option<u64>,
        synchronous: bool,
    ) -> Result<()> {
        self.check()?;
        self.tracker
            .update_remote_volume(remote_name, RemoteVolumeState::Deleting, size, None);
        let (item, done) = WorkItem::new(OperationKind::Delete, remote_name);
        self.enqueue(item.with_expected(size, None)).await?;
        if synchronous {
            self.wait(done).await?;
        }
        self.check()
    }

    /// Create the backend's target folder.
    pub async fn create_folder(&self) -> Result<()> {
        let (item, done) = WorkItem::new(OperationKind::CreateFolder, "");
        self.enqueue(item).await?;
        self.wait(done).await.map(|_| ())
    }

    /// Wait until everything queued so far has run. The pipeline stays open.
    pub async fn wait_for_empty(&self) -> Result<()> {
        let (item, done) = WorkItem::new(OperationKind::Barrier, "");
        self.enqueue(item).await?;
        self.wait(done).await.map(|_| ())
    }

    /// Run everything queued so far, then stop accepting work.
    pub async fn wait_for_complete(&self) -> Result<()> {
        let (item, done) = WorkItem::new(OperationKind::Terminate, "");
        self.enqueue(item).await?;
        self.wait(done).await.map(|_| ())
    }

    /// Stop the worker, cancelling the operation in flight.
    ///
    /// Waits at most `shutdown_timeout` for the worker; if it does not stop in
    /// time it is aborted and [`ShutdownStatus::TimedOut`] is returned.
    /// Concurrent and repeated calls all return the first call's status.
    pub async fn shutdown(&self) -> ShutdownStatus {
        let _ = self.stop.send(true);
        *self.shutdown_status.get_or_init(|| self.stop_worker()).await
    }

    async fn stop_worker(&self) -> ShutdownStatus {
        let task = self.worker.lock().take();
        let Some(mut task) = task else {
            return ShutdownStatus::Clean;
        };

        let status = match tokio::time::timeout(self.config.shutdown_timeout(), &mut task).await {
            Ok(Ok(Ok(()))) => ShutdownStatus::Clean,
            Ok(Ok(Err(_))) => ShutdownStatus::Failed,
            Ok(Err(e)) => {
                error!(error = %e, "backend worker terminated abnormally");
                ShutdownStatus::Failed
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "backend worker did not stop in time, aborting"
                );
                task.abort();
                ShutdownStatus::TimedOut
            }
        };
        info!(?status, "backend manager shut down");
        status
    }
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("config", &self.config)
            .field("fatal", &self.fatal.get())
            .finish_non_exhaustive()
    }
}
