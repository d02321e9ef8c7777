// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::core::types::{Location, QualifiedRange};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations. The recovery and replication state machines match
/// on these kinds to decide between retry, plan refresh and quarantine.
#[derive(Error, Debug, Clone)]
pub enum TesseraError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Corrupt commit log: {0}")]
    CorruptCommitLog(String),

    #[error("Bad key: {0}")]
    BadKey(String),

    #[error("Range not found: {0}")]
    RangeNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Range already loaded: {0}")]
    RangeAlreadyLoaded(String),

    #[error("Ranges already live on this server: {0}")]
    RangesAlreadyLive(String),

    #[error("Schema generation mismatch: supplied={supplied}, installed={installed}")]
    GenerationMismatch { supplied: u32, installed: u32 },

    #[error("Recovery plan generation mismatch: supplied={supplied}, installed={installed}")]
    PlanGenerationMismatch { supplied: u32, installed: u32 },

    #[error("No phantom range map found for recovery of {0}")]
    PhantomRangeMapNotFound(Location),

    #[error("Fragment already processed: {0}")]
    FragmentAlreadyProcessed(String),

    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    #[error("Clock skew exceeded for update")]
    ClockSkewExceeded,

    #[error("Replication cluster not found: {0}")]
    ReplicationClusterNotFound(String),

    #[error("Duplicate move registered for range {0}")]
    DuplicateMove(QualifiedRange),

    #[error("Lock conflict on {0}")]
    LockConflict(String),

    #[error("Hyperspace error: {0}")]
    Hyperspace(String),

    #[error("Metalog error: {0}")]
    Metalog(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server shutting down")]
    ShuttingDown,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Structural errors mean the caller's model of the world is stale; the
    /// recovery state machine handles them by re-reading the plan rather than
    /// by surfacing the failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TesseraError::RangeNotFound(_)
                | TesseraError::TableNotFound(_)
                | TesseraError::RangeAlreadyLoaded(_)
                | TesseraError::RangesAlreadyLive(_)
                | TesseraError::PlanGenerationMismatch { .. }
                | TesseraError::PhantomRangeMapNotFound(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for TesseraError {
    fn from(e: std::io::Error) -> Self {
        TesseraError::Io(Arc::new(e))
    }
}

impl From<bincode::error::EncodeError> for TesseraError {
    fn from(e: bincode::error::EncodeError) -> Self {
        TesseraError::Protocol(format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for TesseraError {
    fn from(e: bincode::error::DecodeError) -> Self {
        TesseraError::Protocol(format!("decode error: {e}"))
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for TesseraError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TesseraError::RequestTimeout("deadline elapsed".to_string())
    }
}
