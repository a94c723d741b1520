use tandem_driver::DriverError;
use tandem_types::{StorageKey, TypeError};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store was closed and accepts no further messages.
    #[error("store {0} is closed")]
    Closed(StorageKey),

    /// A message the store cannot act on.
    #[error("unsupported message for {storage_key}: {reason}")]
    UnsupportedMessage { storage_key: StorageKey, reason: String },

    /// A sync request arrived without a sender to answer.
    #[error("sync request to {0} carries no sender id")]
    MissingSender(StorageKey),

    /// The driver state machine did not settle.
    #[error("driver state machine for {storage_key} exceeded {spins} transitions")]
    SpinLimitExceeded { storage_key: StorageKey, spins: usize },

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("invalid storage key: {0}")]
    Key(#[from] TypeError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
