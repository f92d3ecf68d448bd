//! Consensus Log Error Types

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for consensus log operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus log error types
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors: the affected transaction is rolled back, the process keeps serving
    #[error("Term mismatch: expected {expected}, got {actual}")]
    TermMismatch { expected: u64, actual: u64 },

    #[error("Index mismatch: current index is {expected}, entry index is {actual}")]
    IndexMismatch { expected: u64, actual: u64 },

    #[error("Leadership changed while committing index {index} (term {term})")]
    LeadershipChanged { term: u64, index: u64 },

    #[error("Not log owner (status {0})")]
    NotOwner(String),

    // Durability errors: fatal
    #[error("Durability failure during {op}: {source}")]
    Durability {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Corruption errors: the affected segment needs operator intervention
    #[error("Log corrupted in {file:?} at offset {offset}: {reason}")]
    Corrupted {
        file: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Checksum mismatch for index {index}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        index: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Log file chain broken at {file:?}: previous index {marker}, preceding file ends at {expected}")]
    ChainBroken {
        file: PathBuf,
        marker: u64,
        expected: u64,
    },

    #[error("Log index {0} not found")]
    IndexNotFound(u64),

    #[error("Malformed event stream: {0}")]
    MalformedEvent(String),

    // Capacity errors
    #[error("Log too large: {size} bytes exceeds maximum {max}")]
    LogTooLarge { size: u64, max: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid membership string {input:?}: {reason}")]
    MembershipParse { input: String, reason: String },

    #[error("No learner with address {0}")]
    LearnerNotFound(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    // Metadata persistence
    #[error("Metadata error: {0}")]
    Meta(#[from] rusqlite::Error),

    #[error("State error: {0}")]
    State(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build a durability error for a failed write/fsync/truncate
    pub fn durability(op: &'static str, source: std::io::Error) -> Self {
        Error::Durability { op, source }
    }

    /// Protocol errors roll back a single transaction and are reported to its caller
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::TermMismatch { .. }
                | Error::IndexMismatch { .. }
                | Error::LeadershipChanged { .. }
                | Error::NotOwner(_)
                | Error::ShuttingDown
        )
    }

    /// Check if this error leaves the log in a state where serving must stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Durability { .. }
                | Error::Io(_)
                | Error::Corrupted { .. }
                | Error::ChecksumMismatch { .. }
                | Error::ChainBroken { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LearnerNotFound(_) | Error::NotOwner(_))
    }

    /// Check if this error is a corruption of on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. } | Error::ChecksumMismatch { .. } | Error::ChainBroken { .. }
        )
    }
}
