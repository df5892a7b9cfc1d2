//! Error types for the cache hierarchy.
//!
//! Four kinds make up the taxonomy (spec §7): configuration errors raised
//! at construction, `CacheMiss` when the whole chain lacks a key,
//! `BackingStoreClosed` when a store operation is attempted while closed,
//! and key-missing errors from direct single-layer removal.

use thiserror::Error;

/// Unified error type for the cache chain.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration errors — raised at construction
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Protocol conditions
    // =========================================================================
    #[error("cache miss: {key}")]
    CacheMiss { key: String },

    #[error("chain has no backing store")]
    NoBackingStore,

    #[error("backing store is closed")]
    BackingStoreClosed,

    // =========================================================================
    // Key-missing — direct single-layer removal
    // =========================================================================
    #[error("key not present: {0}")]
    KeyMissing(String),

    // =========================================================================
    // External collaborator errors
    // =========================================================================
    #[error("persistent store error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Which of the design's four error kinds this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Miss,
    StoreClosed,
    KeyMissing,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::NoBackingStore => ErrorKind::Configuration,
            Error::CacheMiss { .. } => ErrorKind::Miss,
            Error::BackingStoreClosed => ErrorKind::StoreClosed,
            Error::KeyMissing(_) => ErrorKind::KeyMissing,
            Error::Storage(_) | Error::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// True for errors a caller can recover from locally (e.g. `SetDefault`
    /// catching a `CacheMiss`). Everything else propagates to the caller
    /// per spec §7's propagation policy.
    pub fn is_recoverable_locally(&self) -> bool {
        matches!(self, Error::CacheMiss { .. })
    }
}

/// Result type alias for the cache chain.
pub type Result<T> = std::result::Result<T, Error>;
