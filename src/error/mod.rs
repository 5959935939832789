//! Error types and handling for Nightdrop
//!
//! One crate-wide error enum covering the messaging core: pre-key lifecycle,
//! obfuscation, storage admission, retrieval, and transport failures.

use thiserror::Error;

/// Result type alias for Nightdrop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Nightdrop error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Message validation
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message too large: {size} bytes (maximum {max})")]
    TooLarge { size: usize, max: usize },

    // Pre-key lifecycle
    #[error("No pre-key bundle for peer {0}")]
    NoPreKeys(String),

    #[error("Insufficient pre-keys for peer {0}: {1} remaining, minimum {2}")]
    InsufficientPreKeys(String, usize, usize),

    #[error("Pre-key {id} not found for peer {peer}")]
    PreKeyNotFound { peer: String, id: u32 },

    #[error("Pre-key {id} already used (replay rejected)")]
    PreKeyReplay { id: u32 },

    // Storage
    #[error("Message not found")]
    MessageNotFound,

    #[error("Storage full: {count} of {capacity} messages")]
    StorageFull { count: usize, capacity: usize },

    #[error("Too many messages stored for pseudonym: {0}")]
    TooManyForPseudonym(usize),

    #[error("Epoch {epoch} outside the acceptance window (current {current})")]
    InvalidEpoch { epoch: u64, current: u64 },

    #[error("Message expired")]
    MessageExpired,

    // Obfuscation
    #[error("Message is not addressed to us")]
    NotForUs,

    #[error("Recipient proof verification failed")]
    InvalidProof,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // Retrieval
    #[error("No storage nodes available")]
    NoStorageNodes,

    #[error("No known senders to try decryption against")]
    NoKnownSenders,

    #[error("Message could not be decrypted with any known sender key")]
    Undecryptable,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Transport
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Persistence
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Legacy surface
    #[error("Deprecated API: {0}")]
    Deprecated(&'static str),
}

impl Error {
    /// True for failures of a single remote node that callers should log and
    /// skip rather than abort the whole operation on.
    pub fn is_per_node(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::TransportUnavailable(_)
        )
    }
}
