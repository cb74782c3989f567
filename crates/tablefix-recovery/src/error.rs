//! Error types for the recovery subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Error reported by the storage engine collaborator.
///
/// Engines that know which segment failed its checksum should fill in
/// `corrupted_segment`; otherwise the path is recovered from `message`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    /// Human-readable error text as produced by the engine.
    pub message: String,
    /// Segment file the engine identified as corrupted, if it reports one.
    pub corrupted_segment: Option<PathBuf>,
}

impl EngineError {
    /// Creates an engine error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            corrupted_segment: None,
        }
    }

    /// Creates a checksum error that names the corrupted segment explicitly.
    pub fn corrupted(message: impl Into<String>, segment: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            corrupted_segment: Some(segment.into()),
        }
    }
}

/// Error variants for the recovery workflow.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The store failed to open for a reason the workflow does not repair.
    #[error("unsupported error: {0}")]
    Unsupported(EngineError),

    /// A checksum error was reported but no segment path could be recovered from it.
    #[error("checksum error does not name a segment file: {message}")]
    UnparseableSegmentPath {
        /// The engine message that was parsed.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("{op} failed on {}: {source}", .path.display())]
    Filesystem {
        /// The operation that failed, e.g. "read_dir" or "lchown".
        op: &'static str,
        /// The path the operation was applied to.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A path that must be a directory is something else.
    #[error("not a directory: {}", .path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The requested backup location lies inside the store being backed up.
    #[error("backup dir {} is inside store dir {}", .backup.display(), .store.display())]
    BackupInsideStore {
        /// The store directory.
        store: PathBuf,
        /// The rejected backup directory.
        backup: PathBuf,
    },

    /// Creating or verifying the backup failed.
    #[error("unable to back up store to {}: {source}", .destination.display())]
    Backup {
        /// The backup destination.
        destination: PathBuf,
        /// What went wrong while cloning or verifying.
        #[source]
        source: Box<RecoveryError>,
    },

    /// The backup does not match the source tree.
    #[error("backup mismatch at {}: {reason}", .path.display())]
    BackupMismatch {
        /// Path relative to the backup root.
        path: PathBuf,
        /// Description of the difference.
        reason: String,
    },

    /// The first destructive open succeeded, which the engine contract rules out.
    #[error("problem appeared: store fixed before restart")]
    FixedBeforeRestart,

    /// The store still fails to open after the repair attempt.
    #[error("unable to open store after fix attempt: {0}")]
    RepairFailed(EngineError),

    /// Releasing a store handle failed.
    #[error("failed to close store: {0}")]
    Close(EngineError),
}

impl RecoveryError {
    pub(crate) fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }
}
