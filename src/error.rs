/*!
 * Error types for ferry
 */

use crate::client::ClientError;
use crate::duration::DurationError;
use crate::session::SessionError;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, FerryError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

/// A source that could not be turned into transfer tasks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnumerationError {
    #[error("{url} is a folder, use --recursive to copy it")]
    SourceIsFolder { url: String },

    #[error("Source and target are the same: {url}")]
    SameSourceTarget { url: String },

    #[error("Unsupported source type: {url}")]
    InvalidSource { url: String },

    #[error("Target {url} must be a folder when copying multiple sources")]
    TargetNotFolder { url: String },

    #[error("Unable to read {url}: {source}")]
    Client { url: String, source: ClientError },
}

#[derive(Debug)]
pub enum FerryError {
    /// Source could not be enumerated
    Enumeration(EnumerationError),

    /// Storage client failure with the URL being worked on
    Client { url: String, source: ClientError },

    /// Session could not be read or persisted
    Session(SessionError),

    /// Invalid flags or configuration
    Config(String),

    /// I/O error outside a storage client
    Io(io::Error),

    /// Work stopped by the cancellation signal
    Cancelled,

    /// Generic error with message
    Other(String),
}

/// How the transfer loop reacts to a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported and counted; the batch continues and the resume marker
    /// moves past the task
    Ignorable,
    /// Stop taking new tasks, drain in-flight work, keep the session
    BatchFatal,
    /// The session itself cannot be persisted
    Checkpoint,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Ignorable => "ignorable",
            ErrorClass::BatchFatal => "fatal",
            ErrorClass::Checkpoint => "checkpoint",
        };
        write!(f, "{}", s)
    }
}

/// Classify a task failure
pub fn classify(err: &FerryError) -> ErrorClass {
    match err {
        FerryError::Enumeration(_) => ErrorClass::Ignorable,
        FerryError::Client { source, .. } => match source {
            ClientError::BrokenSymlink { .. }
            | ClientError::TooManySymlinks { .. }
            | ClientError::PathNotFound { .. }
            | ClientError::ObjectMissing { .. }
            | ClientError::ObjectAlreadyExists { .. }
            | ClientError::ObjectAlreadyExistsAsDirectory { .. }
            | ClientError::BucketNameEmpty
            | ClientError::BucketDoesNotExist { .. }
            | ClientError::BucketInvalid { .. }
            | ClientError::ObjectOnGlacier { .. } => ErrorClass::Ignorable,
            _ => ErrorClass::BatchFatal,
        },
        FerryError::Session(_) => ErrorClass::Checkpoint,
        _ => ErrorClass::BatchFatal,
    }
}

impl FerryError {
    /// Wrap a client error with the URL it concerns
    pub fn client(url: impl Into<String>, source: ClientError) -> Self {
        FerryError::Client {
            url: url.into(),
            source,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FerryError::Cancelled => EXIT_INTERRUPTED,
            FerryError::Enumeration(_) => EXIT_PARTIAL,
            _ => EXIT_FATAL,
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            FerryError::Client { source, .. } => source.is_retryable(),
            FerryError::Io(io_err) => Self::is_io_transient(io_err),
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
                | WriteZero
        )
    }

    /// URL the error refers to, if any
    pub fn url(&self) -> Option<&str> {
        match self {
            FerryError::Client { url, .. } => Some(url),
            FerryError::Enumeration(e) => match e {
                EnumerationError::SourceIsFolder { url }
                | EnumerationError::SameSourceTarget { url }
                | EnumerationError::InvalidSource { url }
                | EnumerationError::TargetNotFolder { url }
                | EnumerationError::Client { url, .. } => Some(url),
            },
            _ => None,
        }
    }
}

impl fmt::Display for FerryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FerryError::Enumeration(e) => write!(f, "{}", e),
            FerryError::Client { url, source } => write!(f, "{}: {}", url, source),
            FerryError::Session(e) => write!(f, "Session error: {}", e),
            FerryError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FerryError::Io(e) => write!(f, "I/O error: {}", e),
            FerryError::Cancelled => write!(f, "Operation cancelled"),
            FerryError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FerryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FerryError::Enumeration(e) => Some(e),
            FerryError::Client { source, .. } => Some(source),
            FerryError::Session(e) => Some(e),
            FerryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FerryError {
    fn from(err: io::Error) -> Self {
        FerryError::Io(err)
    }
}

impl From<SessionError> for FerryError {
    fn from(err: SessionError) -> Self {
        FerryError::Session(err)
    }
}

impl From<EnumerationError> for FerryError {
    fn from(err: EnumerationError) -> Self {
        FerryError::Enumeration(err)
    }
}

impl From<DurationError> for FerryError {
    fn from(err: DurationError) -> Self {
        FerryError::Config(err.to_string())
    }
}
