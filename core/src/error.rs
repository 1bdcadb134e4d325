//! Error kinds surfaced by the session manager and its collaborators.
//!
//! `CoreError` is the top-level enum returned by the Manager and Execution
//! Loop; `DownloadError` is narrower and scoped to the Downloader, mirroring
//! how a nested sandbox error kind sits alongside the top-level error enum
//! in the reference codebase this design is modeled on.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("no filename in response headers")]
    NoFilename,

    #[error("failed to download {url}: {cause}")]
    Transport { url: String, cause: String },

    #[error("HTTP {status}: failed to download {url}")]
    BadStatus { url: String, status: u16 },

    #[error("failed to write downloaded file: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("capacity exhausted")]
    CapacityExhausted,

    #[error("session {0} is busy")]
    SessionBusy(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("execution timeout")]
    ExecutionTimeout,

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
