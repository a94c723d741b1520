use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tandem_types::StorageKey;

use crate::error::DriverResult;

/// Future returned by a [`DriverReceiver`].
pub type ReceiverFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked with `(data, version)` whenever the location changes
/// through another connection, and once at registration when the driver
/// already holds data the registrant has not seen.
pub type DriverReceiver = Arc<dyn Fn(Bytes, u64) -> ReceiverFuture + Send + Sync>;

/// Wrap an async closure as a [`DriverReceiver`].
pub fn receiver_fn<F, Fut>(f: F) -> DriverReceiver
where
    F: Fn(Bytes, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |data: Bytes, version: u64| Box::pin(f(data, version)) as ReceiverFuture)
}

/// A connection to one storage location.
///
/// Invariants every implementation upholds:
/// - `send` succeeds only when `version` is exactly one more than the version
///   the location currently holds; otherwise it returns `Ok(false)` and
///   changes nothing.
/// - A successful `send` mints a new token and notifies every *other*
///   connection's receiver with the new data and version.
/// - At most one receiver is registered per connection.
#[async_trait]
pub trait Driver: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    /// Opaque marker of the data currently held, if any.
    fn token(&self) -> Option<String>;

    /// Register the receiver. When the location holds data whose token differs
    /// from `token`, the receiver is called with it before this returns.
    async fn register_receiver(
        &self,
        token: Option<String>,
        receiver: DriverReceiver,
    ) -> DriverResult<()>;

    /// Write `data` at `version`. Returns `Ok(false)` when the version is not
    /// the immediate successor of the stored one.
    async fn send(&self, data: Bytes, version: u64) -> DriverResult<bool>;

    /// Open another independent connection to the same location.
    async fn clone_driver(&self) -> DriverResult<Arc<dyn Driver>>;

    /// Detach the receiver and reject further calls.
    async fn close(&self) -> DriverResult<()>;
}

/// Opens drivers for the storage keys it recognises.
#[async_trait]
pub trait DriverProvider: Send + Sync {
    fn will_support(&self, key: &StorageKey) -> bool;

    async fn driver(&self, key: &StorageKey) -> DriverResult<Arc<dyn Driver>>;
}
