use tandem_types::StorageKey;

/// Errors from driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No registered provider serves the key's protocol.
    #[error("no driver provider for {0}")]
    NoProvider(StorageKey),

    /// The driver was closed and accepts no further calls.
    #[error("driver for {0} is closed")]
    Closed(StorageKey),

    /// A receiver is already registered on this driver.
    #[error("driver for {0} already has a receiver")]
    ReceiverAlreadyRegistered(StorageKey),

    /// I/O failure in the underlying storage.
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;
