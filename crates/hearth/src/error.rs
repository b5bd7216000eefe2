//! Hub error types
//!
//! Display strings double as the rejection reasons callers see.

use crate::addon::manifest::ManifestError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Add already in progress")]
    AddInProgress,

    #[error("Remove already in progress")]
    RemoveInProgress,

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The add-on answered a request with a failure
    #[error("{0}")]
    Rejected(String),

    /// The owning plugin went away before a reply arrived
    #[error("Request abandoned: {0}")]
    Abandoned(String),

    #[error("Add-on {0} is not connected")]
    NotConnected(String),

    #[error("{0} already in progress")]
    Busy(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Package error: {0}")]
    Package(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn add-on: {0}")]
    Spawn(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] hearth_ipc::IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
