use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use tandem_crdt::CrdtModel;
use tandem_driver::DriverFactory;
use tandem_types::{ReferenceId, StorageKey};
use tracing::{debug, info};

use crate::callback::{callback_fn, Callback, CallbackManager};
use crate::config::StoreConfig;
use crate::direct::DirectStore;
use crate::error::{StoreError, StoreResult};
use crate::message::{CallbackId, MuxedProxyMessage, ProxyMessage};
use crate::observer::{self, Boundary, ObservedMessage, StoreObserver};
use crate::store::StoreOptions;

type Muxed<M> = MuxedProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Op>;

/// A child store plus the id its forwarding callback holds on it.
struct StoreRecord<M: CrdtModel> {
    id: CallbackId,
    store: DirectStore<M>,
}

impl<M: CrdtModel> Clone for StoreRecord<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: self.store.clone(),
        }
    }
}

/// Open child stores in least-recently-used order.
///
/// Pinned ids are never evicted. While they outnumber the capacity the cache
/// grows to hold them and shrinks back as they are unpinned.
struct StoreCache<M: CrdtModel> {
    capacity: NonZeroUsize,
    stores: LruCache<ReferenceId, StoreRecord<M>>,
    pinned: HashMap<ReferenceId, usize>,
}

impl<M: CrdtModel> StoreCache<M> {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            stores: LruCache::new(capacity),
            pinned: HashMap::new(),
        }
    }

    /// A live record for `mux_id`. Closed stores are dropped on the way.
    fn get(&mut self, mux_id: &str) -> Option<StoreRecord<M>> {
        if self.stores.peek(mux_id)?.store.is_closed() {
            self.stores.pop(mux_id);
            return None;
        }
        self.stores.get(mux_id).cloned()
    }

    /// Insert and return whatever no longer fits.
    fn insert(&mut self, mux_id: ReferenceId, record: StoreRecord<M>) -> Vec<StoreRecord<M>> {
        let mut evicted = Vec::new();
        if !self.stores.contains(&mux_id) && self.stores.len() >= self.stores.cap().get() {
            match self.unpinned_lru() {
                Some(victim) => evicted.extend(self.stores.pop(&victim)),
                None => self.stores.resize(self.stores.cap().saturating_add(1)),
            }
        }
        evicted.extend(self.stores.push(mux_id, record).map(|(_, old)| old));
        evicted
    }

    fn unpinned_lru(&self) -> Option<ReferenceId> {
        self.stores
            .iter()
            .rev()
            .map(|(id, _)| id)
            .find(|id| !self.pinned.contains_key(*id))
            .cloned()
    }

    fn pin(&mut self, mux_id: &str) {
        *self.pinned.entry(mux_id.to_string()).or_insert(0) += 1;
    }

    /// Drop one pin on `mux_id` and return the stores that no longer fit.
    fn unpin(&mut self, mux_id: &str) -> Vec<StoreRecord<M>> {
        if let Some(count) = self.pinned.get_mut(mux_id) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(mux_id);
            }
        }
        let mut evicted = Vec::new();
        while self.stores.len() > self.capacity.get() {
            let Some(victim) = self.unpinned_lru() else {
                break;
            };
            evicted.extend(self.stores.pop(&victim));
        }
        let cap = NonZeroUsize::new(self.stores.len())
            .map_or(self.capacity, |len| len.max(self.capacity));
        self.stores.resize(cap);
        evicted
    }

    /// Remove every unpinned store.
    fn release(&mut self) -> Vec<StoreRecord<M>> {
        let ids: Vec<ReferenceId> = self
            .stores
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !self.pinned.contains_key(*id))
            .cloned()
            .collect();
        ids.iter().filter_map(|id| self.stores.pop(id)).collect()
    }

    fn drain(&mut self) -> Vec<StoreRecord<M>> {
        self.pinned.clear();
        let mut records = Vec::with_capacity(self.stores.len());
        while let Some((_, record)) = self.stores.pop_lru() {
            records.push(record);
        }
        self.stores.resize(self.capacity);
        records
    }

    /// Cached ids, least recently used first.
    fn ids(&self) -> Vec<ReferenceId> {
        self.stores.iter().rev().map(|(id, _)| id.clone()).collect()
    }

    fn stores(&self) -> Vec<DirectStore<M>> {
        self.stores.iter().map(|(_, r)| r.store.clone()).collect()
    }
}

/// One logical store over many direct stores, one per mux id.
///
/// Child stores live at `storage_key.child(mux_id)` and are opened on first
/// use. At most `backing_cache_capacity` stay open; the least recently used
/// is closed to make room and reopened from its driver when next needed.
/// Pinned children stay open regardless.
pub struct DirectStoreMuxer<M: CrdtModel> {
    inner: Arc<MuxInner<M>>,
}

impl<M: CrdtModel> Clone for DirectStoreMuxer<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MuxInner<M: CrdtModel> {
    storage_key: StorageKey,
    drivers: DriverFactory,
    config: StoreConfig,
    observer: Option<Arc<dyn StoreObserver>>,
    cache: tokio::sync::Mutex<StoreCache<M>>,
    callbacks: CallbackManager<Muxed<M>>,
    closed: AtomicBool,
}

impl<M: CrdtModel + Default> DirectStoreMuxer<M> {
    pub fn new(
        storage_key: StorageKey,
        drivers: DriverFactory,
        config: StoreConfig,
        observer: Option<Arc<dyn StoreObserver>>,
    ) -> Self {
        let cache = StoreCache::new(config.backing_cache_capacity);
        Self {
            inner: Arc::new(MuxInner {
                storage_key,
                drivers,
                config,
                observer,
                cache: tokio::sync::Mutex::new(cache),
                callbacks: CallbackManager::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.inner.storage_key
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn on(&self, callback: Arc<dyn Callback<Muxed<M>>>) -> StoreResult<CallbackId> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.storage_key.clone()));
        }
        Ok(self.inner.callbacks.register(callback))
    }

    pub fn off(&self, id: CallbackId) {
        self.inner.callbacks.unregister(id);
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Route a message to the child store for its mux id.
    pub async fn on_proxy_message(&self, message: Muxed<M>) -> StoreResult<bool> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(StoreError::Closed(inner.storage_key.clone()));
        }
        observer::notify(
            inner.observer.as_ref(),
            &ObservedMessage {
                boundary: Boundary::BackingStore,
                storage_key: &inner.storage_key,
                kind: message.message.kind(),
                sender: message.message.id(),
                mux_id: Some(&message.mux_id),
                message: &message,
            },
        );
        let MuxedProxyMessage { mux_id, message } = message;
        if let ProxyMessage::SyncRequest { .. } = message {
            return Err(StoreError::UnsupportedMessage {
                storage_key: inner.storage_key.clone(),
                reason: "backing stores do not answer sync requests".into(),
            });
        }
        let record = self.store_for(&mux_id).await?;
        // The sender is represented by the forwarder, so the child never echoes back.
        let message = match message.id() {
            Some(_) => message.with_id(Some(record.id)),
            None => message,
        };
        record.store.on_proxy_message(message).await
    }

    /// The child store's data for `mux_id`, opening the store if needed.
    pub async fn local_data(&self, mux_id: &str) -> StoreResult<M::Data> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.storage_key.clone()));
        }
        Ok(self.store_for(mux_id).await?.store.local_data())
    }

    /// Ids of the open child stores, least recently used first.
    pub async fn cached_ids(&self) -> Vec<ReferenceId> {
        self.inner.cache.lock().await.ids()
    }

    /// Keep the child store for `mux_id` open, opening it if needed, until a
    /// matching [`unpin`](Self::unpin). Pins nest.
    pub async fn pin(&self, mux_id: &str) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.storage_key.clone()));
        }
        self.inner.cache.lock().await.pin(mux_id);
        if let Err(e) = self.store_for(mux_id).await {
            self.unpin(mux_id).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn unpin(&self, mux_id: &str) {
        let evicted = self.inner.cache.lock().await.unpin(mux_id);
        close_all(evicted).await;
    }

    /// Wait until every open child store is idle.
    pub async fn idle(&self) {
        let stores = self.inner.cache.lock().await.stores();
        for store in stores {
            store.idle().await;
        }
    }

    /// Close and forget every open child store that is not pinned.
    pub async fn clear_stores_cache(&self) {
        let records = self.inner.cache.lock().await.release();
        if !records.is_empty() {
            debug!(
                storage_key = %self.inner.storage_key,
                count = records.len(),
                "clearing backing store cache"
            );
        }
        close_all(records).await;
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let records = self.inner.cache.lock().await.drain();
        close_all(records).await;
        self.inner.callbacks.clear();
        info!(storage_key = %self.inner.storage_key, "backing store closed");
    }

    async fn store_for(&self, mux_id: &str) -> StoreResult<StoreRecord<M>> {
        let (record, evicted) = {
            let mut cache = self.inner.cache.lock().await;
            match cache.get(mux_id) {
                Some(record) => (record, Vec::new()),
                None => {
                    let record = self.open_child(mux_id).await?;
                    let evicted = cache.insert(mux_id.to_string(), record.clone());
                    (record, evicted)
                }
            }
        };
        close_all(evicted).await;
        Ok(record)
    }

    async fn open_child(&self, mux_id: &str) -> StoreResult<StoreRecord<M>> {
        let inner = &self.inner;
        let key = inner.storage_key.child(mux_id);
        let driver = inner.drivers.get_driver(&key).await?;
        let store = DirectStore::create(
            StoreOptions::new(key),
            driver,
            M::default(),
            &inner.config,
            inner.observer.clone(),
        )
        .await?;
        let weak: Weak<MuxInner<M>> = Arc::downgrade(inner);
        let owned_id: ReferenceId = mux_id.to_string();
        let forwarder = callback_fn(move |message: ProxyMessage<M::Data, M::Op>| {
            let weak = weak.clone();
            let mux_id = owned_id.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.callbacks.send(MuxedProxyMessage::new(mux_id, message), None).await;
                }
            }
        });
        let id = store.on(forwarder).await?;
        debug!(storage_key = %inner.storage_key, mux_id, "opened backing child store");
        Ok(StoreRecord { id, store })
    }
}

/// Closing a closed store is skipped; close failures are logged by the store.
async fn close_all<M: CrdtModel>(records: Vec<StoreRecord<M>>) {
    for record in records {
        if !record.store.is_closed() {
            debug!(storage_key = %record.store.storage_key(), "closing evicted child store");
            record.store.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_crdt::{CrdtEntity, EntityData, EntityOp, FieldValue};
    use tandem_driver::{VolatileDriverProvider, VolatileMemory};
    use tandem_types::{Actor, VersionMap};
    use tokio::sync::mpsc;

    type EntityMuxer = DirectStoreMuxer<CrdtEntity>;
    type EntityMuxed = MuxedProxyMessage<EntityData, EntityOp>;

    fn muxer(memory: &Arc<VolatileMemory>, capacity: usize) -> EntityMuxer {
        let provider = VolatileDriverProvider::new(Arc::clone(memory));
        let drivers = DriverFactory::new().with_provider(Arc::new(provider));
        let config = StoreConfig {
            backing_cache_capacity: capacity,
            ..StoreConfig::default()
        };
        DirectStoreMuxer::new(StorageKey::new("volatile", "backing"), drivers, config, None)
    }

    fn set_name(actor: &str, name: &str) -> EntityOp {
        EntityOp::SetSingleton {
            actor: Actor::from(actor),
            clock: [(actor, 1)].into_iter().collect::<VersionMap>(),
            field: "name".into(),
            value: FieldValue::text(name),
        }
    }

    fn operations(mux_id: &str, op: EntityOp, id: Option<CallbackId>) -> EntityMuxed {
        MuxedProxyMessage::new(mux_id, ProxyMessage::Operations { operations: vec![op], id })
    }

    #[tokio::test]
    async fn writes_land_in_per_id_child_stores() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 10);
        for (id, name) in [("e1", "ada"), ("e2", "bob")] {
            let message = operations(id, set_name("w", name), None);
            assert!(muxer.on_proxy_message(message).await.unwrap());
        }
        muxer.idle().await;

        let e1 = CrdtEntity::from_data(muxer.local_data("e1").await.unwrap()).consumer_view();
        assert_eq!(e1.singleton("name"), Some(&FieldValue::text("ada")));
        assert!(memory.contains(&StorageKey::new("volatile", "backing/e1")));
        assert!(memory.contains(&StorageKey::new("volatile", "backing/e2")));
    }

    #[tokio::test]
    async fn changes_are_forwarded_with_mux_id_but_not_echoed() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = muxer
            .on(callback_fn(move |message: EntityMuxed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                }
            }))
            .await
            .unwrap();

        muxer.on_proxy_message(operations("e1", set_name("w", "ada"), Some(id))).await.unwrap();
        assert!(rx.try_recv().is_err());

        muxer.on_proxy_message(operations("e1", set_name("v", "cy"), None)).await.unwrap();
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.mux_id, "e1");
        assert!(matches!(forwarded.message, ProxyMessage::Operations { id: None, .. }));
    }

    #[tokio::test]
    async fn sync_requests_are_rejected() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 10);
        let message = MuxedProxyMessage::new("e1", ProxyMessage::SyncRequest { id: Some(1) });
        assert!(matches!(
            muxer.on_proxy_message(message).await,
            Err(StoreError::UnsupportedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn least_recently_used_store_is_evicted_and_reopened() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 2);
        muxer.on_proxy_message(operations("e1", set_name("w", "ada"), None)).await.unwrap();
        muxer.on_proxy_message(operations("e2", set_name("w", "bob"), None)).await.unwrap();
        muxer.local_data("e1").await.unwrap();
        muxer.on_proxy_message(operations("e3", set_name("w", "cy"), None)).await.unwrap();
        assert_eq!(muxer.cached_ids().await, vec!["e1".to_string(), "e3".to_string()]);

        // Reopened from its driver with the data it had.
        let e2 = CrdtEntity::from_data(muxer.local_data("e2").await.unwrap()).consumer_view();
        assert_eq!(e2.singleton("name"), Some(&FieldValue::text("bob")));
    }

    #[tokio::test]
    async fn pinned_store_outlives_capacity_until_unpinned() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 2);
        muxer.pin("e1").await.unwrap();
        muxer.on_proxy_message(operations("e2", set_name("w", "bob"), None)).await.unwrap();
        muxer.on_proxy_message(operations("e3", set_name("w", "cy"), None)).await.unwrap();
        assert_eq!(muxer.cached_ids().await, vec!["e1".to_string(), "e3".to_string()]);

        muxer.pin("e3").await.unwrap();
        muxer.on_proxy_message(operations("e4", set_name("w", "di"), None)).await.unwrap();
        assert_eq!(muxer.cached_ids().await.len(), 3);

        // Unpinned children are released but pinned ones stay open.
        muxer.clear_stores_cache().await;
        assert_eq!(muxer.cached_ids().await, vec!["e1".to_string(), "e3".to_string()]);

        muxer.unpin("e1").await;
        muxer.unpin("e3").await;
        muxer.on_proxy_message(operations("e5", set_name("w", "ed"), None)).await.unwrap();
        assert_eq!(muxer.cached_ids().await, vec!["e3".to_string(), "e5".to_string()]);
    }

    #[tokio::test]
    async fn clear_and_close() {
        let memory = Arc::new(VolatileMemory::new());
        let muxer = muxer(&memory, 4);
        muxer.on_proxy_message(operations("e1", set_name("w", "ada"), None)).await.unwrap();
        muxer.clear_stores_cache().await;
        assert!(muxer.cached_ids().await.is_empty());
        muxer.close().await;
        muxer.close().await;
        assert!(matches!(
            muxer.on_proxy_message(operations("e1", set_name("w", "x"), None)).await,
            Err(StoreError::Closed(_))
        ));
    }
}
