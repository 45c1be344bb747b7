use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while loading a script or driving a connection through it.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to read script {path}: {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("unsupported uri: {0}")]
    UnsupportedUri(String),
    #[error("malformed command {line:?}: {reason}")]
    MalformedCommand { line: String, reason: String },
    #[error("invalid marble value map {map:?}: {source}")]
    MarbleValueMap {
        map: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("test {0} has no subscriber and no channel")]
    NoInteraction(String),
    #[error("channel script for {0} terminated abnormally")]
    ChannelThread(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("connection closed")]
    ConnectionClosed,
}

impl DriverError {
    pub(crate) fn connect(endpoint: impl Into<String>, source: io::Error) -> Self {
        DriverError::Connect {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub(crate) fn unsupported_uri(uri: impl Into<String>) -> Self {
        DriverError::UnsupportedUri(uri.into())
    }
}
