//! Client-side CRDT caches for Tandem.
//!
//! A [`StorageProxy`] holds an application's copy of a CRDT model. It applies
//! local writes immediately, forwards them to a store, and merges whatever
//! the store sends back. Application code observes the proxy through handle
//! callbacks, which run on a per-proxy scheduler.
//!
//! # Key Types
//!
//! - [`StorageProxy`] -- The cache and its sync state machine
//! - [`ProxyState`] -- `NoSync`, `ReadyToSync`, `AwaitingSync`, `Sync`, `Desync`, `Closed`
//! - [`ProxyOptions`] / [`ProxyMode`] -- Read-write or write-only
//! - [`HandleId`] / [`StorageEvent`] -- Who a callback belongs to and what it hears about
//! - [`WriteAck`] -- The store's verdict on a local write

pub mod error;
pub mod handles;
pub mod proxy;
mod scheduler;
pub mod state;

pub use error::{ProxyError, ProxyResult};
pub use handles::{HandleId, StorageEvent};
pub use proxy::{ProxyMode, ProxyOptions, StorageProxy, WriteAck};
pub use state::ProxyState;
