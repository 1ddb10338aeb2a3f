use std::path::PathBuf;
use thiserror::Error;

/// Failures of a session transition. Panel failures never show up here; they
/// are collected in a [`crate::session::FanOutReport`] instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a user name is required before starting a session")]
    MissingUser,
    #[error("a session is already running in {0}")]
    AlreadyRunning(PathBuf),
    #[error("no session is running")]
    NotRunning,
    #[error("failed to create session directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open tag log: {0}")]
    TagLog(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("panel '{0}' is not in the catalog")]
    NotFound(String),
    #[error("panel '{name}' failed to build: {source}")]
    Build {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to reach {addr}: {source}")]
    Send {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed bus message: {0}")]
    Decode(#[from] serde_json::Error),
}
