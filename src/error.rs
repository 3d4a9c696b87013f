//! # Crate-wide error taxonomy
//!
//! Every component maps its local failures onto one of the kinds below before
//! they cross a component boundary (storage, codec, command, connection,
//! anti-entropy). Callers match on `errorCode`-equivalent variants rather than
//! parsing strings; `anyhow` is used at the binary boundary in `main.rs`.

use thiserror::Error;

/// Numeric error codes surfaced on the wire for the command layer.
pub mod error_code {
    pub const INVALID_REQUEST: u32 = 100;
    pub const TIMEOUT: u32 = 101;
    pub const IDEMPOTENT_REPLAY: u32 = 102;
    pub const PAYLOAD_TOO_LARGE: u32 = 103;
    pub const INTERNAL_ERROR: u32 = 199;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleKvError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation timed out")]
    Timeout,

    #[error("idempotent replay of a cached response")]
    IdempotentReplay,

    #[error("payload exceeds the size cap: {0}")]
    PayloadTooLarge(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("tombstone carried a value")]
    TombstoneWithValue,

    #[error("event timestamp is too far in the future")]
    ClockSkew,

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("storage corruption detected: {0}")]
    StorageCorruption(String),

    #[error("anti-entropy rate limit exceeded")]
    RateLimited,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("merkle tree error: {0}")]
    MerkleTreeError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl MerkleKvError {
    /// Maps this error to the numeric `errorCode` used on the command-layer wire
    /// format. Kinds with no direct wire representation collapse to
    /// `InternalError`.
    pub fn error_code(&self) -> u32 {
        match self {
            MerkleKvError::InvalidConfiguration(_) => error_code::INVALID_REQUEST,
            MerkleKvError::InvalidRequest(_) => error_code::INVALID_REQUEST,
            MerkleKvError::Timeout => error_code::TIMEOUT,
            MerkleKvError::IdempotentReplay => error_code::IDEMPOTENT_REPLAY,
            MerkleKvError::PayloadTooLarge(_) => error_code::PAYLOAD_TOO_LARGE,
            _ => error_code::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, MerkleKvError>;
