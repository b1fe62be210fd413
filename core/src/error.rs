//! Error types for KeyRecorder.
//!
//! Each subsystem has its own error enum next to its code. This module
//! gathers them into [`RecorderError`] for callers that drive more than one
//! subsystem.

use thiserror::Error;

use crate::coordinator::CoordinatorError;
use crate::ipc::IpcError;
use crate::store::StoreError;

/// Errors that can occur anywhere in the recorder.
///
/// # Examples
///
/// ```ignore
/// use keyrecorder_core::error::Result;
///
/// async fn open(coordinator: &Coordinator) -> Result<()> {
///     coordinator.initialize().await?;
///     coordinator.start()?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Store tier error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Coordinator lifecycle or task error.
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Control channel error.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorState;
    use std::path::PathBuf;

    #[test]
    fn store_init_error_display() {
        let err = StoreError::Init {
            path: PathBuf::from("/data/hot.db"),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to initialize store at /data/hot.db: permission denied"
        );
    }

    #[test]
    fn store_not_initialized_display() {
        let err = StoreError::NotInitialized {
            path: PathBuf::from("/data/main.db"),
        };
        assert_eq!(err.to_string(), "store at /data/main.db is not initialized");
    }

    #[test]
    fn recorder_error_wraps_store_error() {
        let err: RecorderError = StoreError::SnapshotExists {
            name: "snapshot_20260101_000000.db".to_string(),
        }
        .into();
        assert!(matches!(err, RecorderError::Store(_)));
        assert_eq!(
            err.to_string(),
            "store error: snapshot snapshot_20260101_000000.db already exists"
        );
    }

    #[test]
    fn recorder_error_wraps_coordinator_error() {
        let err: RecorderError = CoordinatorError::InvalidState {
            operation: "sync",
            state: CoordinatorState::Closed,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "coordinator error: cannot sync while coordinator is closed"
        );
    }

    #[test]
    fn recorder_error_wraps_ipc_error() {
        let err: RecorderError = IpcError::NotConnected.into();
        assert_eq!(
            err.to_string(),
            "IPC error: not connected to the control channel"
        );
    }

    #[test]
    fn recorder_error_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid").unwrap_err();
        let err: RecorderError = json_err.into();
        assert!(matches!(err, RecorderError::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn result_type_alias_works() {
        fn example_function() -> Result<i32> {
            Ok(42)
        }

        fn example_error_function() -> Result<i32> {
            Err(IpcError::NotConnected.into())
        }

        assert!(example_function().is_ok());
        assert!(example_error_function().is_err());
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: RecorderError = io_err.into();

        assert!(err.source().is_some());
    }
}
