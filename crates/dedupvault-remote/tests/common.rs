//! Shared fixtures for the remote pipeline integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dedupvault_remote::{
    AuxiliaryArtifact, BackendConfig, BackendManager, BackendMetrics, EncryptionModule,
    InMemoryVolumeTracker, MemoryBackend, MemoryCapability, Result,
};
use tempfile::TempPath;

/// Install a test-friendly subscriber once; RUST_LOG controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Retry immediately so failure tests stay fast.
pub fn fast_config(retries: u32) -> BackendConfig {
    BackendConfig {
        number_of_retries: retries,
        retry_delay_ms: 0,
        shutdown_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// A manager wired to a fresh in-memory backend and tracker.
pub struct Pipeline {
    pub manager: Arc<BackendManager>,
    pub backend: MemoryBackend,
    pub tracker: Arc<InMemoryVolumeTracker>,
}

impl Pipeline {
    pub fn start(config: BackendConfig) -> Self {
        Self::start_with(MemoryBackend::new(), config, MemoryCapability::Basic, None)
    }

    pub fn start_with(
        backend: MemoryBackend,
        config: BackendConfig,
        capability: MemoryCapability,
        encryption: Option<Arc<dyn EncryptionModule>>,
    ) -> Self {
        init_tracing();
        let tracker = Arc::new(InMemoryVolumeTracker::new());
        let manager = BackendManager::new(
            backend.factory(capability),
            config,
            encryption,
            tracker.clone(),
            Arc::new(BackendMetrics::new()),
        )
        .expect("manager starts");
        Self {
            manager: Arc::new(manager),
            backend,
            tracker,
        }
    }
}

/// A temporary file holding `data`.
pub fn temp_file(data: &[u8]) -> TempPath {
    let path = tempfile::NamedTempFile::new()
        .expect("create temp file")
        .into_temp_path();
    std::fs::write(&path, data).expect("write temp file");
    path
}

/// Index-style artifact that records the primary volume's hash and size.
pub struct IndexArtifact {
    name: String,
    file: TempPath,
}

impl IndexArtifact {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: temp_file(b""),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.file.to_path_buf()
    }
}

impl AuxiliaryArtifact for IndexArtifact {
    fn remote_name(&self) -> &str {
        &self.name
    }

    fn local_path(&self) -> &Path {
        &self.file
    }

    fn finish(&mut self, primary_hash: &str, primary_size: u64) -> Result<()> {
        std::fs::write(&self.file, format!("{}:{}", primary_hash, primary_size))?;
        Ok(())
    }
}
