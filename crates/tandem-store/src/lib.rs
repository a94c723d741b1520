//! Stores that keep CRDT models synchronized between proxies and storage.
//!
//! A store sits between any number of in-memory proxies and one storage
//! driver. Proxies send it operations, whole models and sync requests; the
//! store merges them into its own model, persists the result through the
//! driver and fans changes out to the other proxies. Changes arriving from
//! the driver are merged and fanned out the same way.
//!
//! # Key Types
//!
//! - [`DirectStore`] -- One model, one driver, with a versioned write state machine
//! - [`DirectStoreMuxer`] -- Lazily opened direct stores, one per entity id
//! - [`ReferenceModeStore`] -- Entities in a backing muxer, references in a container store
//! - [`ProxyMessage`] / [`MuxedProxyMessage`] -- The messages stores and proxies exchange
//! - [`CallbackManager`] -- Registry of proxy callbacks keyed by [`CallbackId`]
//! - [`WriteBack`] -- Inline or queued persistence of store writes
//! - [`StoreFactory`] -- Opens the right store for a storage key
//!
//! # Design Rules
//!
//! 1. A store never holds a lock while awaiting a callback it delivers to.
//! 2. Driver writes carry a version exactly one above the last accepted one.
//! 3. A proxy never receives its own change back, only other proxies do.
//! 4. Reference-mode stores write entities before the references to them.

pub mod callback;
pub mod codec;
pub mod config;
pub mod direct;
pub mod error;
pub mod factory;
pub mod message;
pub mod muxer;
pub mod observer;
pub mod reference_mode;
pub mod store;
pub mod write_back;

pub use callback::{callback_fn, Callback, CallbackManager, MuxedCallback, ProxyCallback};
pub use codec::{decode_model, encode_model, Framed, MessageCodec, MAX_FRAME_SIZE};
pub use config::{StoreConfig, WriteBackConfig};
pub use direct::{DirectStore, StoreState};
pub use error::{StoreError, StoreResult};
pub use factory::{EntityStore, StoreFactory};
pub use message::{CallbackId, MessageKind, MuxedProxyMessage, ProxyMessage};
pub use muxer::DirectStoreMuxer;
pub use observer::{Boundary, LoggingObserver, ObservedMessage, ObserverError, StoreObserver};
pub use reference_mode::{
    BlockId, HoldQueue, RefModeData, RefModeMessage, RefModeOp, ReferenceModeStore, SendQueue,
};
pub use store::{ActiveStore, StoreOptions};
pub use write_back::{FlushJob, WriteBack};
