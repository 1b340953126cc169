//! Error types for the disk buffer

use std::fmt;

pub type Result<T> = std::result::Result<T, BufferError>;

/// Conditions raised by a single buffer file.
///
/// These are recoverable at the storage layer: the stale handle is dropped and
/// a fresh file is requested from the folder manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// Appending the record would grow the file past `max_file_size`
    SizeExceeded,

    /// The filesystem rejected the write for lack of space
    NoSpace,

    /// The file's write or read window has elapsed
    Expired,

    /// Every record in the file has been handed out
    NoMoreRecords,

    /// The handle was closed, either by its owner or by the folder manager
    Closed,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::SizeExceeded => write!(f, "maximum file size exceeded"),
            FileError::NoSpace => write!(f, "no space left on device"),
            FileError::Expired => write!(f, "file window expired"),
            FileError::NoMoreRecords => write!(f, "no more records available"),
            FileError::Closed => write!(f, "file is closed"),
        }
    }
}

#[derive(Debug)]
pub enum BufferError {
    /// IO operation failed
    Io(std::io::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// Configuration error
    Config(String),

    /// A buffer file could not serve the request
    File(FileError),

    /// The storage or queue has been shut down
    Closed,

    /// Reading kept failing against fresh files
    MaxAttemptsReached(u32),

    /// Serializer or deserializer rejected the payload
    Serialization(String),

    /// Neither the disk nor the passthrough export accepted the batch
    ExportFailed(String),

    /// Forwarding transport error
    Transport(String),

    /// API misuse, such as removing before reading
    InvalidState(String),
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Io(err) => write!(f, "IO error: {}", err),
            BufferError::Json(err) => write!(f, "JSON error: {}", err),
            BufferError::Http(err) => write!(f, "HTTP error: {}", err),
            BufferError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BufferError::File(err) => write!(f, "Buffer file error: {}", err),
            BufferError::Closed => write!(f, "Storage is closed"),
            BufferError::MaxAttemptsReached(attempts) => {
                write!(f, "Gave up after {} attempts", attempts)
            }
            BufferError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            BufferError::ExportFailed(msg) => write!(f, "Export failed: {}", msg),
            BufferError::Transport(msg) => write!(f, "Transport error: {}", msg),
            BufferError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for BufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BufferError::Io(err) => Some(err),
            BufferError::Json(err) => Some(err),
            BufferError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BufferError {
    fn from(err: std::io::Error) -> Self {
        BufferError::Io(err)
    }
}

impl From<serde_json::Error> for BufferError {
    fn from(err: serde_json::Error) -> Self {
        BufferError::Json(err)
    }
}

impl From<reqwest::Error> for BufferError {
    fn from(err: reqwest::Error) -> Self {
        BufferError::Http(err)
    }
}

impl From<FileError> for BufferError {
    fn from(err: FileError) -> Self {
        BufferError::File(err)
    }
}
