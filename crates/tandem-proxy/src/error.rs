use tandem_types::StorageKey;
use thiserror::Error;

use crate::state::ProxyState;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy for {0} is closed")]
    Closed(StorageKey),

    #[error("proxy for {0} is write-only")]
    WriteOnly(StorageKey),

    #[error("proxy for {storage_key} is not set up to sync (state {state})")]
    NotSyncing { storage_key: StorageKey, state: ProxyState },

    #[error("proxy for {storage_key} has not synced yet (state {state})")]
    NotSynced { storage_key: StorageKey, state: ProxyState },

    #[error("callback {label} of {handle} panicked: {message}")]
    CallbackPanicked {
        handle: String,
        label: &'static str,
        message: String,
    },

    #[error("store error: {0}")]
    Store(#[from] tandem_store::StoreError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
