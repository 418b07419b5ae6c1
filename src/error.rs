use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::TransferId;

#[derive(Debug, Error, Diagnostic)]
pub enum DtsError {
    #[error("transfer engine is already running")]
    AlreadyRunning,

    #[error("transfer engine is not running")]
    NotRunning,

    #[error("transfer engine stopped responding")]
    EngineDisconnected,

    #[error("failed to start engine thread: {0}")]
    WorkerSpawn(String),

    #[error("directory {path} is not writable: {reason}")]
    DirectoryUnwritable { path: String, reason: String },

    #[error("no files requested")]
    NoFilesRequested,

    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("unknown transport endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),

    #[error("transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("invalid instructions: {0}")]
    InvalidInstructions(String),

    #[error("no local user for {0}")]
    UnknownUser(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("staging failed: {0}")]
    Staging(String),

    #[error("transfer failed: {0}")]
    Transport(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("manifest generation failed: {0}")]
    Manifest(String),

    #[error("failed to write snapshot {path}: {reason}")]
    SnapshotWrite { path: String, reason: String },

    #[error("snapshot {path} is corrupt: {reason}")]
    SnapshotCorrupt { path: String, reason: String },

    #[error("snapshot version {found} is not supported (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("repository {repository} rejected its saved state: {reason}")]
    AdapterState { repository: String, reason: String },

    #[error("missing config file dts.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl DtsError {
    /// Errors a caller caused by sending a bad request; the table is untouched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DtsError::NoFilesRequested
                | DtsError::InvalidRepositoryName(_)
                | DtsError::UnknownRepository(_)
                | DtsError::UnknownEndpoint(_)
                | DtsError::InvalidTransferId(_)
                | DtsError::TransferNotFound(_)
                | DtsError::InvalidInstructions(_)
                | DtsError::UnknownUser(_)
                | DtsError::ResourceNotFound(_)
        )
    }
}
