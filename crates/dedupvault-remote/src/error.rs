//! Error types for the remote backend pipeline.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for remote pipeline operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Error variants for remote pipeline operations.
///
/// The type is `Clone` so that a single sticky failure can be handed to every
/// waiting producer; I/O sources are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Wraps standard I/O errors from local file handling or a backend.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The pluggable backend could not be instantiated.
    #[error("Backend construction failed: {0}")]
    BackendConstruction(String),

    /// A backend call failed; treated as transient.
    #[error("Remote operation failed: {0}")]
    Remote(String),

    /// The backend reported that a remote file does not exist.
    #[error("Remote file not found: {0}")]
    NotFound(String),

    /// The backend's target folder does not exist.
    #[error("Remote folder missing: {0}")]
    FolderMissing(String),

    /// Downloaded file hash differs from the recorded hash.
    #[error("Hash mismatch on {name}: expected {expected}, actual {actual}")]
    HashMismatch {
        /// Remote volume name.
        name: String,
        /// Hash recorded locally.
        expected: String,
        /// Hash of the downloaded bytes.
        actual: String,
    },

    /// Downloaded file size differs from the recorded size.
    #[error("Size mismatch on {name}: expected {expected} bytes, actual {actual} bytes")]
    SizeMismatch {
        /// Remote volume name.
        name: String,
        /// Size recorded locally.
        expected: u64,
        /// Size of the downloaded file.
        actual: u64,
    },

    /// Encryption or decryption failed; data may be corrupted or tampered.
    #[error("Cryptographic failure: {0}")]
    Cryptographic(String),

    /// The backend does not implement the requested capability.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The named digest algorithm is not available.
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was discarded because the pipeline shut down.
    #[error("Operation cancelled: backend pipeline has shut down")]
    Cancelled,

    /// The remote listing disagrees with the locally recorded volumes.
    #[error("Remote listing mismatch: {extra} extra file(s), {missing} missing file(s)")]
    RemoteListMismatch {
        /// Number of unexpected remote files.
        extra: usize,
        /// Number of recorded volumes absent from the backend.
        missing: usize,
    },
}

impl RemoteError {
    /// Whether the worker should retry an operation that failed with this error.
    ///
    /// Verification, cryptographic, construction and capability errors are
    /// permanent; everything raised by the backend itself is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Io(_)
                | RemoteError::Remote(_)
                | RemoteError::NotFound(_)
                | RemoteError::FolderMissing(_)
        )
    }

    /// Build a transient backend error from any displayable cause.
    pub fn remote(cause: impl std::fmt::Display) -> Self {
        RemoteError::Remote(cause.to_string())
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_alias() {
        let ok: Result<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: Result<i32> = Err(RemoteError::Cancelled);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: RemoteError = std_err.into();
        assert!(matches!(err, RemoteError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_verification_errors_are_permanent() {
        let hash = RemoteError::HashMismatch {
            name: "a.zip".to_string(),
            expected: "x".to_string(),
            actual: "y".to_string(),
        };
        let size = RemoteError::SizeMismatch {
            name: "a.zip".to_string(),
            expected: 10,
            actual: 11,
        };
        assert!(!hash.is_retryable());
        assert!(!size.is_retryable());
        assert!(!RemoteError::Cryptographic("bad tag".into()).is_retryable());
        assert!(!RemoteError::BackendConstruction("bad url".into()).is_retryable());
        assert!(!RemoteError::UnsupportedOperation("create_folder".into()).is_retryable());
    }

    #[test]
    fn test_clone_keeps_message() {
        let err = RemoteError::from(std::io::Error::other("disk gone"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.to_string().contains("disk gone"));
    }

    #[test]
    fn test_size_mismatch_display() {
        let err = RemoteError::SizeMismatch {
            name: "vol.dblock".to_string(),
            expected: 10,
            actual: 999,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("vol.dblock"));
        assert!(msg.contains("999"));
    }

    #[test]
    fn test_list_mismatch_display() {
        let err = RemoteError::RemoteListMismatch { extra: 1, missing: 2 };
        assert_eq!(
            format!("{}", err),
            "Remote listing mismatch: 1 extra file(s), 2 missing file(s)"
        );
    }
}
