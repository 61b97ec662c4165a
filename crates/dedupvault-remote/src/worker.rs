//! The single consumer of the operation queue.
//!
//! Every backend call of a [`BackendManager`](crate::manager::BackendManager)
//! runs here, one item at a time, in enqueue order. Failed attempts are
//! retried; once an item exhausts its attempts the error becomes the sticky
//! fatal error, the queue is completed and everything still queued is
//! signalled with that error.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::RemoteEntry;
use crate::config::BackendConfig;
use crate::error::{RemoteError, Result};
use crate::metrics::BackendMetrics;
use crate::queue::{DownloadedVolume, OperationKind, OperationOutput, QueueReceiver, WorkItem};
use crate::session::{hash_file, BackendSession};
use crate::throttle::Throttled;
use crate::volume::{LogLevel, RemoteVolumeState, VolumeStateTracker};

/// Sticky fatal error shared between the worker and producers.
pub type FatalSlot = Arc<OnceLock<RemoteError>>;

/// Executes work items against a backend session.
pub struct Worker {
    session: BackendSession,
    config: BackendConfig,
    tracker: Arc<dyn VolumeStateTracker>,
    metrics: Arc<BackendMetrics>,
    fatal: FatalSlot,
    upload_succeeded: bool,
}

async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a request.
    let _ = signal.wait_for(|stop| *stop).await;
}

impl Worker {
    /// Create a worker; nothing runs until [`run`](Self::run) is spawned.
    pub fn new(
        session: BackendSession,
        config: BackendConfig,
        tracker: Arc<dyn VolumeStateTracker>,
        metrics: Arc<BackendMetrics>,
        fatal: FatalSlot,
    ) -> Self {
        Self {
            session,
            config,
            tracker,
            metrics,
            fatal,
            upload_succeeded: false,
        }
    }

    /// Process items until Terminate, a fatal error, shutdown, or until every
    /// producer is gone.
    pub async fn run(mut self, mut rx: QueueReceiver, mut shutdown: watch::Receiver<bool>) {
        info!("backend worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                item = rx.dequeue() => item,
            };
            let Some(mut item) = next else {
                break;
            };

            match item.kind {
                OperationKind::Terminate => {
                    rx.complete();
                    item.complete(Ok(OperationOutput::Done));
                    break;
                }
                OperationKind::Barrier => {
                    item.complete(Ok(OperationOutput::Done));
                    continue;
                }
                _ => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => Err(RemoteError::Cancelled),
                result = self.execute_with_retries(&mut item) => result,
            };

            match outcome {
                Ok(output) => item.complete(Ok(output)),
                Err(RemoteError::Cancelled) => {
                    debug!(operation = %item.kind, name = %item.remote_name, "operation cancelled by shutdown");
                    item.complete(Err(RemoteError::Cancelled));
                    break;
                }
                Err(e) => {
                    error!(
                        operation = %item.kind,
                        name = %item.remote_name,
                        error = %e,
                        "remote operation failed permanently"
                    );
                    self.tracker.log_message(
                        LogLevel::Error,
                        &format!("Operation {} with file {} failed", item.kind, item.remote_name),
                        Some(&e),
                    );
                    let _ = self.fatal.set(e.clone());
                    rx.complete();
                    item.complete(Err(e));
                    break;
                }
            }
        }

        let pending = rx.drain();
        if !pending.is_empty() {
            let err = self.fatal.get().cloned().unwrap_or(RemoteError::Cancelled);
            debug!(count = pending.len(), error = %err, "signalling queued operations");
            for item in pending {
                item.complete(Err(err.clone()));
            }
        }
        self.session.invalidate().await;
        info!("backend worker stopped");
    }

    async fn execute_with_retries(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        let attempts = self.config.number_of_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.config.no_connection_reuse {
                self.session.invalidate().await;
            }

            let e = match self.execute(item).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if !e.is_retryable() || attempt >= attempts {
                return Err(e);
            }

            let message = format!(
                "Operation {} with file {} attempt {} of {} failed with message: {}",
                item.kind, item.remote_name, attempt, attempts, e
            );
            warn!(
                operation = %item.kind,
                name = %item.remote_name,
                attempt,
                attempts,
                error = %e,
                "remote operation attempt failed, retrying"
            );
            self.tracker.log_message(LogLevel::Warning, &message, Some(&e));
            self.metrics.record_retry();

            // A freshly created folder keeps the connection and skips the delay.
            if self.create_missing_folder(&e).await {
                continue;
            }
            self.session.invalidate().await;
            let delay = self.config.retry_delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn create_missing_folder(&mut self, e: &RemoteError) -> bool {
        if !matches!(e, RemoteError::FolderMissing(_))
            || !self.config.autocreate_folders
            || self.upload_succeeded
        {
            return false;
        }
        self.metrics.record_remote_call();
        let result = match self.session.ensure() {
            Ok(handle) => handle.create_folder().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                info!("created missing target folder");
                true
            }
            Err(err) => {
                warn!(error = %err, missing = %e, "failed to create target folder");
                false
            }
        }
    }

    async fn execute(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        match item.kind {
            OperationKind::Put => self.put(item).await,
            OperationKind::Get => self.get(item).await,
            OperationKind::List => self.list().await,
            OperationKind::Delete => self.delete(item).await,
            OperationKind::CreateFolder => self.create_folder(item).await,
            OperationKind::Terminate | OperationKind::Barrier => Ok(OperationOutput::Done),
        }
    }

    async fn put(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        self.session.encrypt_if_needed(item).await?;
        let path: PathBuf = item
            .local_file
            .as_ref()
            .map(|f| f.path())
            .ok_or_else(|| {
                RemoteError::Config(format!("no local file for upload of {}", item.remote_name))
            })?;

        let (size, hash) = match (item.size, item.hash.clone()) {
            (Some(size), Some(hash)) => (size, hash),
            _ => {
                let (size, hash) = hash_file(&path).await?;
                item.size = Some(size);
                item.hash = Some(hash.clone());
                if item.tracked {
                    self.tracker.update_remote_volume(
                        &item.remote_name,
                        RemoteVolumeState::Uploading,
                        Some(size),
                        Some(hash.clone()),
                    );
                }
                (size, hash)
            }
        };

        if let Some(shadow) = item.shadow.take() {
            shadow.finish(&hash, size)?;
        }

        self.metrics.record_remote_call();
        self.tracker.log_remote_operation(
            "put",
            &item.remote_name,
            Some(json!({ "Size": size, "Hash": hash }).to_string()),
        );
        info!(name = %item.remote_name, size, "uploading volume");

        let rate = self.config.max_upload_per_second;
        let handle = self.session.ensure()?;
        if handle.supports_streaming() {
            let file = tokio::fs::File::open(&path).await?;
            let mut source = Throttled::new(file, rate);
            handle.put_stream(&item.remote_name, &mut source).await?;
        } else {
            handle.put(&item.remote_name, &path).await?;
        }

        debug!(name = %item.remote_name, size, "uploaded volume");
        self.metrics.record_upload(size);

        if self.config.list_verify_uploads {
            self.metrics.record_remote_call();
            let entries = self.session.ensure()?.list().await?;
            verify_listed_upload(&entries, &item.remote_name, size)?;
        }
        self.upload_succeeded = true;
        Ok(OperationOutput::Done)
    }

    async fn get(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        info!(name = %item.remote_name, expected_size = ?item.size, "downloading volume");
        self.metrics.record_remote_call();
        let download = tempfile::NamedTempFile::new()?.into_temp_path();

        let rate = self.config.max_download_per_second;
        let handle = self.session.ensure()?;
        if handle.supports_streaming() {
            let file = tokio::fs::File::create(&download).await?;
            let mut sink = Throttled::new(file, rate);
            handle.get_stream(&item.remote_name, &mut sink).await?;
            sink.flush().await?;
        } else {
            handle.get(&item.remote_name, &download).await?;
        }

        let (size, actual_hash) = hash_file(&download).await?;
        self.metrics.record_download(size);
        self.tracker.log_remote_operation(
            "get",
            &item.remote_name,
            Some(json!({ "Size": size, "Hash": actual_hash }).to_string()),
        );
        debug!(name = %item.remote_name, size, "downloaded volume");

        let hash = if self.config.skip_file_hash_checks {
            item.hash.clone()
        } else {
            if let Some(expected) = item.size {
                if expected != size {
                    return Err(RemoteError::SizeMismatch {
                        name: item.remote_name.clone(),
                        expected,
                        actual: size,
                    });
                }
            }
            if let Some(expected) = item.hash.as_deref().filter(|h| !h.is_empty()) {
                if expected != actual_hash {
                    return Err(RemoteError::HashMismatch {
                        name: item.remote_name.clone(),
                        expected: expected.to_string(),
                        actual: actual_hash,
                    });
                }
            }
            Some(actual_hash)
        };

        if item.verify_only {
            return Ok(OperationOutput::Done);
        }

        let file = self.session.decrypt_after_get(download).await?;
        Ok(OperationOutput::Downloaded(DownloadedVolume { file, hash, size }))
    }

    async fn list(&mut self) -> Result<OperationOutput> {
        self.metrics.record_remote_call();
        let entries = self.session.ensure()?.list().await?;
        self.tracker
            .log_remote_operation("list", "", Some(serde_json::to_string(&entries)?));
        debug!(entries = entries.len(), "listed remote folder");
        Ok(OperationOutput::Listing(entries))
    }

    async fn delete(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        info!(name = %item.remote_name, "deleting volume");
        self.metrics.record_remote_call();
        let handle = self.session.ensure()?;
        let mut result = handle.delete(&item.remote_name).await;

        if let Err(RemoteError::NotFound(_)) = &result {
            // Treat as deleted if the listing confirms the file is gone.
            if let Ok(entries) = handle.list().await {
                if !entries.iter().any(|e| e.name == item.remote_name) {
                    debug!(name = %item.remote_name, "delete target already absent");
                    result = Ok(());
                }
            }
        }

        self.tracker.log_remote_operation(
            "delete",
            &item.remote_name,
            result.as_ref().err().map(|e| e.to_string()),
        );
        result?;

        if item.tracked {
            self.tracker.update_remote_volume(
                &item.remote_name,
                RemoteVolumeState::Deleted,
                None,
                None,
            );
        }
        Ok(OperationOutput::Done)
    }

    async fn create_folder(&mut self, item: &mut WorkItem) -> Result<OperationOutput> {
        self.metrics.record_remote_call();
        let result = self.session.ensure()?.create_folder().await;
        self.tracker.log_remote_operation(
            "createfolder",
            &item.remote_name,
            result.as_ref().err().map(|e| e.to_string()),
        );
        result?;
        info!("created target folder");
        Ok(OperationOutput::Done)
    }
}

fn verify_listed_upload(entries: &[RemoteEntry], name: &str, size: u64) -> Result<()> {
    let Some(entry) = entries.iter().find(|e| e.name.eq_ignore_ascii_case(name)) else {
        return Err(RemoteError::remote(format!(
            "list verify failed, file was not found after upload: {}",
            name
        )));
    };
    match entry.size {
        Some(listed) if listed != size => Err(RemoteError::remote(format!(
            "list verify failed for file {}: size was {} but expected {}",
            entry.name, listed, size
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryBackend, MemoryCapability};
    use crate::queue::{operation_queue, Completion, OperationQueue};
    use crate::volume::InMemoryVolumeTracker;

    struct Harness {
        queue: OperationQueue,
        backend: MemoryBackend,
        tracker: Arc<InMemoryVolumeTracker>,
        metrics: Arc<BackendMetrics>,
        fatal: FatalSlot,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: BackendConfig, capability: MemoryCapability) -> Harness {
        let backend = MemoryBackend::new();
        let tracker = Arc::new(InMemoryVolumeTracker::new());
        let metrics = Arc::new(BackendMetrics::new());
        let fatal: FatalSlot = Arc::new(OnceLock::new());
        let (queue, rx) = operation_queue(Some(16));
        let (stop, stop_rx) = watch::channel(false);
        let worker = Worker::new(
            BackendSession::new(backend.factory(capability), None),
            config,
            tracker.clone(),
            metrics.clone(),
            fatal.clone(),
        );
        let task = tokio::spawn(worker.run(rx, stop_rx));
        Harness {
            queue,
            backend,
            tracker,
            metrics,
            fatal,
            stop,
            task,
        }
    }

    fn quick_config(retries: u32) -> BackendConfig {
        BackendConfig {
            number_of_retries: retries,
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    async fn submit_put(h: &Harness, name: &str, data: &[u8]) -> Completion {
        let file = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        std::fs::write(&file, data).unwrap();
        let (item, done) = WorkItem::new(OperationKind::Put, name);
        let item = item.with_local_file(crate::queue::LocalFile::Owned(file));
        h.queue.enqueue(item).await.unwrap();
        done
    }

    async fn submit(h: &Harness, kind: OperationKind, name: &str) -> Completion {
        let (item, done) = WorkItem::new(kind, name);
        h.queue.enqueue(item).await.unwrap();
        done
    }

    #[tokio::test]
    async fn test_list_succeeds_after_transient_failures() {
        let h = start(quick_config(3), MemoryCapability::Basic);
        h.backend.insert("a", b"1".to_vec());
        h.backend.fail_next(2);

        let done = submit(&h, OperationKind::List, "").await;
        match done.await.unwrap().unwrap() {
            OperationOutput::Listing(entries) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(h.metrics.snapshot().retry_attempts, 2);
        assert_eq!(h.tracker.messages().len(), 2);
        // Each failed attempt drops the handle.
        assert_eq!(h.backend.close_count(), 2);
        assert!(h.fatal.get().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_poison_the_queue() {
        let h = start(quick_config(2), MemoryCapability::Basic);
        h.backend.fail_always(true);

        let first = submit(&h, OperationKind::List, "").await;
        let second = submit(&h, OperationKind::Delete, "x").await;

        assert!(matches!(first.await.unwrap(), Err(RemoteError::Remote(_))));
        assert!(matches!(second.await.unwrap(), Err(RemoteError::Remote(_))));
        assert!(matches!(h.fatal.get(), Some(RemoteError::Remote(_))));
        // Only the first failure is followed by a retry.
        assert_eq!(h.metrics.snapshot().retry_attempts, 1);
        h.task.await.unwrap();
        assert!(h.queue.is_completed());
    }

    #[tokio::test]
    async fn test_terminate_completes_queue() {
        let h = start(quick_config(1), MemoryCapability::Basic);

        let barrier = submit(&h, OperationKind::Barrier, "").await;
        let term = submit(&h, OperationKind::Terminate, "").await;
        assert!(matches!(barrier.await.unwrap(), Ok(OperationOutput::Done)));
        assert!(matches!(term.await.unwrap(), Ok(OperationOutput::Done)));
        h.task.await.unwrap();

        let (late, late_done) = WorkItem::new(OperationKind::List, "");
        assert!(h.queue.enqueue(late).await.is_err());
        drop(late_done);
    }

    #[tokio::test]
    async fn test_delete_of_missing_file_is_confirmed_by_listing() {
        let h = start(quick_config(1), MemoryCapability::Basic);
        let done = submit(&h, OperationKind::Delete, "gone.zip").await;
        assert!(matches!(done.await.unwrap(), Ok(OperationOutput::Done)));
        assert_eq!(h.backend.calls(), vec!["delete:gone.zip", "list:"]);

        let ops = h.tracker.operations();
        assert_eq!(ops[0].operation, "delete");
        assert_eq!(ops[0].data, None);
        assert_eq!(
            h.tracker.volume("gone.zip").unwrap().state,
            RemoteVolumeState::Deleted
        );
    }

    #[tokio::test]
    async fn test_create_folder_requires_capability() {
        let h = start(quick_config(3), MemoryCapability::Streaming);
        let done = submit(&h, OperationKind::CreateFolder, "").await;
        assert!(matches!(
            done.await.unwrap(),
            Err(RemoteError::UnsupportedOperation(_))
        ));
        // Not retried.
        assert_eq!(h.metrics.snapshot().retry_attempts, 0);
        assert!(h
            .tracker
            .messages()
            .iter()
            .all(|m| m.level != LogLevel::Warning));
        let ops = h.tracker.operations();
        assert_eq!(ops[0].operation, "createfolder");
        assert!(ops[0].data.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_operation() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let backend = MemoryBackend::new().with_gate(gate.clone());
        let (queue, rx) = operation_queue(Some(4));
        let (stop, stop_rx) = watch::channel(false);
        let fatal: FatalSlot = Arc::new(OnceLock::new());
        let worker = Worker::new(
            BackendSession::new(backend.factory(MemoryCapability::Basic), None),
            quick_config(1),
            Arc::new(InMemoryVolumeTracker::new()),
            Arc::new(BackendMetrics::new()),
            fatal.clone(),
        );
        let task = tokio::spawn(worker.run(rx, stop_rx));

        let (blocked, blocked_done) = WorkItem::new(OperationKind::List, "");
        let (queued, queued_done) = WorkItem::new(OperationKind::List, "");
        queue.enqueue(blocked).await.unwrap();
        queue.enqueue(queued).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        stop.send(true).unwrap();
        task.await.unwrap();
        assert!(matches!(blocked_done.await.unwrap(), Err(RemoteError::Cancelled)));
        assert!(matches!(queued_done.await.unwrap(), Err(RemoteError::Cancelled)));
        assert!(fatal.get().is_none());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_producers_stops_worker() {
        let h = start(quick_config(1), MemoryCapability::Basic);
        let Harness { queue, stop, task, .. } = h;
        drop(queue);
        drop(stop);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_folder_is_created_before_first_upload() {
        let h = start(quick_config(2), MemoryCapability::StreamingWithFolders);
        h.backend.require_folder(true);

        let done = submit_put(&h, "v1", b"payload").await;
        assert!(matches!(done.await.unwrap(), Ok(OperationOutput::Done)));
        assert_eq!(h.backend.calls(), vec!["put:v1", "createfolder:", "put:v1"]);
        assert_eq!(h.backend.contents("v1").unwrap(), b"payload");
        // The connection survives the recovery.
        assert_eq!(h.backend.close_count(), 0);
        assert_eq!(h.metrics.snapshot().retry_attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_folder_after_an_upload_is_not_recreated() {
        let h = start(quick_config(2), MemoryCapability::StreamingWithFolders);
        let first = submit_put(&h, "v1", b"one").await;
        assert!(first.await.unwrap().is_ok());

        h.backend.require_folder(true);
        let second = submit_put(&h, "v2", b"two").await;
        assert!(matches!(
            second.await.unwrap(),
            Err(RemoteError::FolderMissing(_))
        ));
        assert_eq!(h.backend.calls(), vec!["put:v1", "put:v2", "put:v2"]);
        assert!(!h.backend.folder_created());
    }

    #[tokio::test]
    async fn test_missing_folder_left_alone_when_autocreate_disabled() {
        let config = BackendConfig {
            autocreate_folders: false,
            ..quick_config(2)
        };
        let h = start(config, MemoryCapability::StreamingWithFolders);
        h.backend.require_folder(true);

        let done = submit_put(&h, "v1", b"payload").await;
        assert!(matches!(
            done.await.unwrap(),
            Err(RemoteError::FolderMissing(_))
        ));
        assert_eq!(h.backend.calls(), vec!["put:v1", "put:v1"]);
    }

    #[tokio::test]
    async fn test_list_verify_detects_lost_upload() {
        let config = BackendConfig {
            list_verify_uploads: true,
            ..quick_config(1)
        };
        let h = start(config, MemoryCapability::Basic);
        h.backend.discard_puts(true);

        let done = submit_put(&h, "v1", b"payload").await;
        match done.await.unwrap() {
            Err(RemoteError::Remote(msg)) => assert!(msg.contains("not found after upload")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.backend.calls(), vec!["put:v1", "list:"]);
    }

    #[tokio::test]
    async fn test_list_verify_accepts_stored_upload() {
        let config = BackendConfig {
            list_verify_uploads: true,
            ..quick_config(1)
        };
        let h = start(config, MemoryCapability::Basic);

        let done = submit_put(&h, "v1", b"payload").await;
        assert!(matches!(done.await.unwrap(), Ok(OperationOutput::Done)));
        assert_eq!(h.backend.calls(), vec!["put:v1", "list:"]);
    }

    #[test]
    fn test_verify_listed_upload_checks_name_and_size() {
        let entries = vec![
            RemoteEntry::file("Vol-1.zip", 5),
            RemoteEntry {
                size: None,
                ..RemoteEntry::file("vol-2.zip", 0)
            },
        ];
        assert!(verify_listed_upload(&entries, "vol-1.zip", 5).is_ok());
        assert!(verify_listed_upload(&entries, "vol-2.zip", 99).is_ok());
        assert!(matches!(
            verify_listed_upload(&entries, "vol-1.zip", 4),
            Err(RemoteError::Remote(_))
        ));
        assert!(verify_listed_upload(&entries, "vol-3.zip", 5).is_err());
    }

    #[tokio::test]
    async fn test_worker_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let backend = MemoryBackend::new();
        let (_queue, rx) = operation_queue(Some(1));
        let (_stop, stop_rx) = watch::channel(false);
        let worker = Worker::new(
            BackendSession::new(backend.factory(MemoryCapability::Streaming), None),
            quick_config(1),
            Arc::new(InMemoryVolumeTracker::new()),
            Arc::new(BackendMetrics::new()),
            Arc::new(OnceLock::new()),
        );
        let run = worker.run(rx, stop_rx);
        assert_send(&run);
    }
}
