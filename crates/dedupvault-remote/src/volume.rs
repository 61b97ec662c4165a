//! Local records of remote volumes and the audit log.
//!
//! The [`VolumeStateTracker`] trait is the pipeline's window onto the local
//! database: the worker writes state transitions and audit entries through it,
//! and reconciliation reads and repairs records through it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RemoteError;

/// Lifecycle state of a remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteVolumeState {
    /// Created locally, not yet queued for upload.
    Temporary,
    /// Upload queued or in flight.
    Uploading,
    /// Confirmed present on the backend.
    Verified,
    /// Delete queued or in flight.
    Deleting,
    /// Delete confirmed.
    Deleted,
}

impl std::fmt::Display for RemoteVolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemoteVolumeState::Temporary => "Temporary",
            RemoteVolumeState::Uploading => "Uploading",
            RemoteVolumeState::Verified => "Verified",
            RemoteVolumeState::Deleting => "Deleting",
            RemoteVolumeState::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Locally persisted knowledge about one remote volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolumeRecord {
    /// Remote file name.
    pub name: String,
    /// Lifecycle state.
    pub state: RemoteVolumeState,
    /// Size in bytes, `None` if unknown.
    pub size: Option<u64>,
    /// Base64 SHA-256 of the uploaded bytes, if known.
    pub hash: Option<String>,
}

impl RemoteVolumeRecord {
    /// A record with unknown size and hash.
    pub fn new(name: impl Into<String>, state: RemoteVolumeState) -> Self {
        Self {
            name: name.into(),
            state,
            size: None,
            hash: None,
        }
    }

    /// Set the known size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the known hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// Severity of a message written to the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Informational.
    Information,
    /// Something failed but will be retried or tolerated.
    Warning,
    /// Something failed for good.
    Error,
}

/// Persistence interface for remote volume state and the remote audit log.
///
/// Implementations must be safe to call from the worker task while producers
/// read from other tasks.
pub trait VolumeStateTracker: Send + Sync {
    /// Create or reset a record in the given state with unknown size and hash.
    fn register_remote_volume(&self, name: &str, state: RemoteVolumeState);

    /// Upsert a record. `None` size or hash leaves the stored value untouched.
    fn update_remote_volume(
        &self,
        name: &str,
        state: RemoteVolumeState,
        size: Option<u64>,
        hash: Option<String>,
    );

    /// Drop a record.
    fn remove_remote_volume(&self, name: &str);

    /// All records, in name order.
    fn remote_volumes(&self) -> Vec<RemoteVolumeRecord>;

    /// Append an entry to the remote operation audit log.
    fn log_remote_operation(&self, operation: &str, name: &str, data: Option<String>);

    /// Append a message to the operation log.
    fn log_message(&self, level: LogLevel, message: &str, error: Option<&RemoteError>);
}

/// One row of the remote operation audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOperationEntry {
    /// Operation label ("put", "get", "list", "delete", "createfolder").
    pub operation: String,
    /// Remote name, empty for listings.
    pub name: String,
    /// JSON payload or error text.
    pub data: Option<String>,
}

/// One row of the operation message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Rendered error, if any.
    pub error: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    volumes: BTreeMap<String, RemoteVolumeRecord>,
    operations: Vec<RemoteOperationEntry>,
    messages: Vec<LoggedMessage>,
}

/// Volume tracker kept entirely in memory.
#[derive(Default)]
pub struct InMemoryVolumeTracker {
    state: Mutex<TrackerState>,
}

impl InMemoryVolumeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = RemoteVolumeRecord>) -> Self {
        let tracker = Self::new();
        {
            let mut state = tracker.state.lock();
            for record in records {
                state.volumes.insert(record.name.clone(), record);
            }
        }
        tracker
    }

    /// Look up one record.
    pub fn volume(&self, name: &str) -> Option<RemoteVolumeRecord> {
        self.state.lock().volumes.get(name).cloned()
    }

    /// Audit log entries in insertion order.
    pub fn operations(&self) -> Vec<RemoteOperationEntry> {
        self.state.lock().operations.clone()
    }

    /// Logged messages in insertion order.
    pub fn messages(&self) -> Vec<LoggedMessage> {
        self.state.lock().messages.clone()
    }
}

impl std::fmt::Debug for InMemoryVolumeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryVolumeTracker")
            .field("volumes", &state.volumes.len())
            .field("operations", &state.operations.len())
            .field("messages", &state.messages.len())
            .finish()
    }
}

impl VolumeStateTracker for InMemoryVolumeTracker {
    fn register_remote_volume(&self, name: &str, state: RemoteVolumeState) {
        self.state
            .lock()
            .volumes
            .insert(name.to_string(), RemoteVolumeRecord::new(name, state));
    }

    fn update_remote_volume(
        &self,
        name: &str,
        state: RemoteVolumeState,
        size: Option<u64>,
        hash: Option<String>,
    ) {
        debug!(name = %name, state = %state, ?size, "remote volume state change");
        let mut guard = self.state.lock();
        let record = guard
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| RemoteVolumeRecord::new(name, state));
        record.state = state;
        if size.is_some() {
            record.size = size;
        }
        if hash.is_some() {
            record.hash = hash;
        }
    }

    fn remove_remote_volume(&self, name: &str) {
        self.state.lock().volumes.remove(name);
    }

    fn remote_volumes(&self) -> Vec<RemoteVolumeRecord> {
        self.state.lock().volumes.values().cloned().collect()
    }

    fn log_remote_operation(&self, operation: &str, name: &str, data: Option<String>) {
        self.state.lock().operations.push(RemoteOperationEntry {
            operation: operation.to_string(),
            name: name.to_string(),
            data,
        });
    }

    fn log_message(&self, level: LogLevel, message: &str, error: Option<&RemoteError>) {
        self.state.lock().messages.push(LoggedMessage {
            level,
            message: message.to_string(),
            error: error.map(|e| e.to_string()),
        });
    }
}
