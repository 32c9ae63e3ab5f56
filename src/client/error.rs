//! Error types for storage clients
//!
//! Every client implementation reports failures through [`ClientError`] so the
//! transfer engine can classify them without knowing which store produced them.

use std::io;
use thiserror::Error;

/// Result type alias for storage client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Typed failure reported by a storage client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Object does not exist: {path}")]
    PathNotFound { path: String },

    #[error("Object disappeared during transfer: {path}")]
    ObjectMissing { path: String },

    #[error("Broken symlink: {path}")]
    BrokenSymlink { path: String },

    #[error("Too many levels of symbolic links: {path}")]
    TooManySymlinks { path: String },

    #[error("Object already exists: {path}")]
    ObjectAlreadyExists { path: String },

    #[error("Object already exists as a directory: {path}")]
    ObjectAlreadyExistsAsDirectory { path: String },

    #[error("Bucket name cannot be empty")]
    BucketNameEmpty,

    #[error("Bucket does not exist: {bucket}")]
    BucketDoesNotExist { bucket: String },

    #[error("Bucket name is invalid: {bucket}")]
    BucketInvalid { bucket: String },

    #[error("Object is in archival storage and must be restored first: {path}")]
    ObjectOnGlacier { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Is a directory: {path}")]
    IsDirectory { path: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Request throttled: {message}")]
    Throttled { message: String },

    #[error("Operation '{operation}' not supported by {client} client")]
    Unsupported { client: String, operation: String },

    #[error("I/O error on {path}: {message}")]
    Io {
        path: String,
        kind: io::ErrorKind,
        message: String,
    },
}

impl ClientError {
    /// Map an I/O error on `path` onto the client taxonomy
    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => ClientError::PathNotFound { path },
            io::ErrorKind::PermissionDenied => ClientError::PermissionDenied { path },
            io::ErrorKind::AlreadyExists => ClientError::ObjectAlreadyExists { path },
            io::ErrorKind::TimedOut => ClientError::Timeout {
                operation: format!("io on {}", path),
            },
            kind => ClientError::Io {
                path,
                kind,
                message: err.to_string(),
            },
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        use io::ErrorKind::*;
        match self {
            ClientError::Network { .. }
            | ClientError::Timeout { .. }
            | ClientError::Throttled { .. } => true,
            ClientError::Io { kind, .. } => matches!(
                kind,
                ConnectionRefused
                    | ConnectionReset
                    | ConnectionAborted
                    | NotConnected
                    | BrokenPipe
                    | Interrupted
                    | WouldBlock
                    | UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the error means "nothing is there"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::PathNotFound { .. }
                | ClientError::ObjectMissing { .. }
                | ClientError::BucketDoesNotExist { .. }
        )
    }
}
