//! Configuration for the remote backend pipeline.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result};

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Wait `retry_delay_ms` before every retry.
    #[default]
    Fixed,
    /// Double the delay after each failed attempt, capped at `max_delay_ms`.
    Exponential {
        /// Upper bound for a single delay in milliseconds.
        max_delay_ms: u64,
    },
}

/// Options consumed by the backend manager and the reconciliation analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Attempts per operation before the session fails (minimum 1).
    pub number_of_retries: u32,
    /// Base delay between attempts in milliseconds (0 = retry immediately).
    pub retry_delay_ms: u64,
    /// How the delay evolves between attempts.
    pub retry_backoff: RetryBackoff,
    /// Return from `put` before the upload has run.
    pub asynchronous_upload: bool,
    /// Queue capacity while uploading asynchronously (0 = unbounded).
    pub asynchronous_upload_limit: usize,
    /// Recreate the backend handle before every attempt.
    pub no_connection_reuse: bool,
    /// Skip size and hash verification of downloads.
    pub skip_file_hash_checks: bool,
    /// Create the target folder when it is missing, until the first upload succeeds.
    pub autocreate_folders: bool,
    /// List the remote folder after each upload and check the file landed.
    pub list_verify_uploads: bool,
    /// Upload rate limit for streaming backends, bytes per second.
    pub max_upload_per_second: Option<u64>,
    /// Download rate limit for streaming backends, bytes per second.
    pub max_download_per_second: Option<u64>,
    /// Name prefix identifying this backup's remote volumes.
    pub backup_prefix: String,
    /// Name suffix identifying this backup's remote volumes ("" = any).
    pub volume_suffix: String,
    /// Bounded wait for the worker during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            number_of_retries: 5,
            retry_delay_ms: 10_000,
            retry_backoff: RetryBackoff::Fixed,
            asynchronous_upload: false,
            asynchronous_upload_limit: 4,
            no_connection_reuse: false,
            skip_file_hash_checks: false,
            autocreate_folders: true,
            list_verify_uploads: false,
            max_upload_per_second: None,
            max_download_per_second: None,
            backup_prefix: String::from("duplicati"),
            volume_suffix: String::new(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl BackendConfig {
    /// Load a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: BackendConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RemoteError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(RemoteError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_retries == 0 {
            return Err(RemoteError::Config(
                "number_of_retries must be at least 1".to_string(),
            ));
        }
        if let RetryBackoff::Exponential { max_delay_ms } = self.retry_backoff {
            if max_delay_ms < self.retry_delay_ms {
                return Err(RemoteError::Config(format!(
                    "max_delay_ms ({}) is smaller than retry_delay_ms ({})",
                    max_delay_ms, self.retry_delay_ms
                )));
            }
        }
        Ok(())
    }

    /// Queue capacity, `None` meaning unbounded.
    ///
    /// Synchronous uploads use a single slot so that a producer never runs
    /// ahead of the worker by more than one operation.
    pub fn queue_capacity(&self) -> Option<usize> {
        if !self.asynchronous_upload {
            Some(1)
        } else if self.asynchronous_upload_limit == 0 {
            None
        } else {
            Some(self.asynchronous_upload_limit)
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        match self.retry_backoff {
            RetryBackoff::Fixed => Duration::from_millis(self.retry_delay_ms),
            RetryBackoff::Exponential { max_delay_ms } => {
                let factor = 1u64 << attempt.saturating_sub(1).min(32);
                let delay = self.retry_delay_ms.saturating_mul(factor).min(max_delay_ms);
                Duration::from_millis(delay)
            }
        }
    }

    /// Bounded wait applied by `BackendManager::shutdown`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
