#![warn(missing_docs)]

//! DedupVault remote subsystem: serialized backend pipeline, volume encryption/verification, listing reconciliation
//!
//! Upload path:   put → queue → worker → Encrypt → Hash → Finalize shadow → Backend put
//! Download path: get → queue → worker → Backend get → Verify size/hash → Decrypt
//! Consistency:   Backend list → Reconcile against local volume records

pub mod backend;
pub mod config;
pub mod encryption;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod metrics;
pub mod mock;
pub mod queue;
pub mod reconcile;
pub mod session;
pub mod throttle;
pub mod volume;
pub mod worker;

pub use backend::{
    BackendFactory, BackendHandle, FolderBackend, RemoteBackend, RemoteEntry, StreamingBackend,
};
pub use config::{BackendConfig, RetryBackoff};
pub use encryption::{AeadFileEncryption, EncryptionAlgorithm, EncryptionKey, EncryptionModule};
pub use error::{RemoteError, Result};
pub use manager::{BackendManager, DownloadHandle, ShutdownStatus, VolumeUpload};
pub use metadata::{HashAlgorithm, MetadataHash};
pub use metrics::{BackendMetrics, MetricsSnapshot, RemoteMetric};
pub use mock::{MemoryBackend, MemoryCapability};
pub use queue::{AuxiliaryArtifact, DownloadedVolume, OperationKind, OperationOutput, WorkItem};
pub use reconcile::{analyze, verify_remote_list, RemoteListAnalysis, VolumeNaming};
pub use session::{hash_file, BackendSession};
pub use throttle::Throttled;
pub use volume::{
    InMemoryVolumeTracker, LogLevel, RemoteVolumeRecord, RemoteVolumeState, VolumeStateTracker,
};
pub use worker::Worker;
