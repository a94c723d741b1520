use async_trait::async_trait;
use tandem_types::StorageKey;

use crate::callback::Callback;
use crate::error::StoreResult;
use crate::message::{CallbackId, ProxyMessage};
use std::sync::Arc;

/// What a store needs to be constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOptions {
    pub storage_key: StorageKey,
    /// Token of the data the caller last saw, if any. The driver skips the
    /// initial load when it still holds data with this token.
    pub version_token: Option<String>,
}

impl StoreOptions {
    pub fn new(storage_key: StorageKey) -> Self {
        Self {
            storage_key,
            version_token: None,
        }
    }

    pub fn with_version_token(mut self, token: impl Into<String>) -> Self {
        self.version_token = Some(token.into());
        self
    }
}

/// The interface proxies talk to, whatever the store's layout.
#[async_trait]
pub trait ActiveStore<D, O>: Send + Sync
where
    D: Send + 'static,
    O: Send + 'static,
{
    fn storage_key(&self) -> StorageKey;

    /// Register a receiver. The returned id is what the caller puts in the
    /// `id` of the messages it sends.
    async fn on(&self, callback: Arc<dyn Callback<ProxyMessage<D, O>>>) -> StoreResult<CallbackId>;

    async fn off(&self, id: CallbackId);

    /// Handle one message from a proxy. `Ok(false)` means the message could
    /// not be applied and the sender was asked to resync.
    async fn on_proxy_message(&self, message: ProxyMessage<D, O>) -> StoreResult<bool>;

    /// Resolve once the store has nothing in flight.
    async fn idle(&self);

    async fn close(&self);
}
