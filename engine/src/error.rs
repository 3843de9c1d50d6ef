use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Filesystem failure detail carried by [`EngineError::Filesystem`].
///
/// These map the handful of filesystem situations the engine has distinct
/// recovery behaviour for; everything else is a generic `Io`.
#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("path does not exist: {0:?}")]
    PathDoesNotExist(PathBuf),

    #[error("path is a file, expected a folder: {0:?}")]
    PathIsAFile(PathBuf),

    #[error("folder is not empty: {0:?}")]
    NotEmpty(PathBuf),

    /// Every ` (N)` suffix up to 999 is already taken.
    #[error("folder contains too many files with the same base name: {0:?}")]
    FolderContainsTooManyFiles(PathBuf),

    /// The platform trash is unavailable (headless session, odd mount, ...).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The closed error set at every engine boundary.
///
/// Each subsystem bubbles its failures up to its top operation as one of
/// these; install jobs translate them into the job's error buffer, the
/// reporter translates them into events (and never reports its own).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed archive, too many components, unreadable manifest.
    #[error("bad archive: {0}")]
    BadArchive(String),

    #[error("archive entry not found: {0}")]
    EntryNotFound(String),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned status {status}: {body}")]
    Non200Response { status: u16, body: String },

    #[error("api error: {0}")]
    Api(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    /// Cancelled via the atomic abort flag.
    #[error("aborted")]
    Aborted,

    /// Checksum mismatch on extraction or a corrupt persisted manifest.
    #[error("corrupted: {0}")]
    Corrupted(String),
}

impl EngineError {
    pub fn bad_archive(message: impl Into<String>) -> Self {
        EngineError::BadArchive(message.into())
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        EngineError::Corrupted(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        EngineError::Network(message.into())
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        EngineError::TimedOut(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        EngineError::Filesystem(FilesystemError::NotSupported(message.into()))
    }

    /// True for errors the install job runner treats as user cancellation
    /// rather than a failure worth reporting.
    pub fn is_abort(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                EngineError::Filesystem(FilesystemError::PathDoesNotExist(PathBuf::new()))
            }
            _ => EngineError::Filesystem(FilesystemError::Io(err)),
        }
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(err: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match err {
            ZipError::Io(io) => EngineError::Filesystem(FilesystemError::Io(io)),
            ZipError::FileNotFound => EngineError::EntryNotFound(String::new()),
            other => EngineError::BadArchive(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::TimedOut(err.to_string())
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Severity attached to reported events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}
