//! Error types for sharekv

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Engine Errors ===
    #[error("Store at {} is locked by another handle", .0.display())]
    Locked(PathBuf),

    #[error("RocksDB error: {0}")]
    Engine(#[from] rocksdb::Error),

    #[error("Store is closed")]
    Closed,

    // === Rendezvous Errors ===
    #[error("Failed to remove stale socket {}: {source}", path.display())]
    StaleArtifact {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Flush barrier failed: {0}")]
    Drain(String),

    // === RPC Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Facade Errors ===
    #[error("Shared store failed: {0}")]
    Failed(Arc<Error>),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this the engine refusing to open because someone else holds the lock?
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::Locked(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}
