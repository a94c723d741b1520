use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tandem_crdt::{
    ContainerData, ContainerKind, ContainerOp, CrdtContainer, CrdtEntity, DataValue, EntityData,
    EntityOp, RawEntity, Reference, SetData, SetOp, SingletonOp,
};
use tandem_driver::DriverFactory;
use tandem_types::{Actor, FieldName, ReferenceId, ReferenceModeStorageKey, StorageKey, VersionMap};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hold::{BlockId, HoldQueue};
use super::queue::ReceiveQueue;
use super::send::SendQueue;
use crate::callback::{callback_fn, Callback, CallbackManager};
use crate::config::StoreConfig;
use crate::direct::DirectStore;
use crate::error::{StoreError, StoreResult};
use crate::message::{CallbackId, MuxedProxyMessage, ProxyMessage};
use crate::muxer::DirectStoreMuxer;
use crate::observer::{self, Boundary, ObservedMessage, StoreObserver};
use crate::store::{ActiveStore, StoreOptions};

/// Proxy-facing data: a set or singleton of whole entities.
pub type RefModeData = ContainerData<RawEntity>;
pub type RefModeOp = ContainerOp<RawEntity>;
pub type RefModeMessage = ProxyMessage<RefModeData, RefModeOp>;

type ContainerModel = CrdtContainer<Reference>;
type ContainerMessage = ProxyMessage<ContainerData<Reference>, ContainerOp<Reference>>;
type BackingMessage = MuxedProxyMessage<EntityData, EntityOp>;

enum Work {
    Proxy {
        message: RefModeMessage,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Container(ContainerMessage),
    Backing(BackingMessage),
    HoldExpired(BlockId),
    ReleaseCaches,
}

/// A callback invocation waiting its turn in the send queue. Entity content
/// is read from the backing store when the send goes out, not when queued.
#[derive(Debug)]
enum PendingSend {
    Forward {
        message: RefModeMessage,
        except: Option<CallbackId>,
    },
    Reply {
        to: CallbackId,
        data: ContainerData<Reference>,
    },
    Broadcast {
        data: ContainerData<Reference>,
    },
    Operation(ContainerOp<Reference>),
    SyncRequest,
}

#[derive(Default)]
struct Bookkeeping {
    /// Highest synthesized version per entity field.
    versions: HashMap<ReferenceId, HashMap<FieldName, u64>>,
    holds: HoldQueue,
    sends: SendQueue<PendingSend>,
    timers: HashMap<BlockId, AbortHandle>,
    /// Backing ids each held send keeps open.
    pins: HashMap<BlockId, Vec<ReferenceId>>,
    next_block: BlockId,
}

impl Bookkeeping {
    /// Let `block` go out with the next dispatch. Returns the ids it pinned.
    fn release(&mut self, block: BlockId) -> Vec<ReferenceId> {
        self.holds.remove(block);
        self.sends.release(block);
        if let Some(timer) = self.timers.remove(&block) {
            timer.abort();
        }
        self.pins.remove(&block).unwrap_or_default()
    }
}

/// Presents a collection (or singleton) of entities to proxies while storing
/// references in a container store and entities in a backing store.
///
/// Every inbound message, whether from a proxy, the container or the backing
/// store, is handled by one worker task in arrival order. Entity writes reach
/// the backing store before the references to them reach the container.
/// Replies that need entities the backing store does not have yet are held
/// until it does, or until the hold times out; on timeout the container is
/// assumed corrupt, cleared, and the request retried.
pub struct ReferenceModeStore {
    inner: Arc<RmsInner>,
}

impl Clone for ReferenceModeStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RmsInner {
    storage_key: StorageKey,
    backing_key: StorageKey,
    kind: ContainerKind,
    crdt_key: Actor,
    container: DirectStore<ContainerModel>,
    container_id: CallbackId,
    backing: DirectStoreMuxer<CrdtEntity>,
    backing_id: CallbackId,
    callbacks: CallbackManager<RefModeMessage>,
    queue: ReceiveQueue<Work>,
    book: Mutex<Bookkeeping>,
    hold_timeout: Duration,
    closed: AtomicBool,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl ReferenceModeStore {
    /// Open the container and backing stores named by a reference-mode key.
    pub async fn create(
        options: StoreOptions,
        kind: ContainerKind,
        drivers: &DriverFactory,
        config: &StoreConfig,
        observer: Option<Arc<dyn StoreObserver>>,
    ) -> StoreResult<Self> {
        let key = ReferenceModeStorageKey::try_from(&options.storage_key)?;
        let container_driver = drivers.get_driver(&key.container).await?;
        let container = DirectStore::create(
            StoreOptions {
                storage_key: key.container.clone(),
                version_token: options.version_token.clone(),
            },
            container_driver,
            CrdtContainer::new(kind),
            config,
            observer.clone(),
        )
        .await?;
        let backing = DirectStoreMuxer::new(
            key.backing.clone(),
            drivers.clone(),
            config.clone(),
            observer.clone(),
        );

        let (queue, rx) = ReceiveQueue::new();
        let to_queue = queue.clone();
        let container_id = container
            .on(callback_fn(move |message: ContainerMessage| {
                let queue = to_queue.clone();
                async move {
                    queue.push(Work::Container(message));
                }
            }))
            .await?;
        let to_queue = queue.clone();
        let backing_id = backing
            .on(callback_fn(move |message: BackingMessage| {
                let queue = to_queue.clone();
                async move {
                    queue.push(Work::Backing(message));
                }
            }))
            .await?;

        let inner = Arc::new(RmsInner {
            storage_key: options.storage_key.clone(),
            backing_key: key.backing.clone(),
            kind,
            crdt_key: Actor::new(format!("rms-{}", Uuid::now_v7())),
            container,
            container_id,
            backing,
            backing_id,
            callbacks: CallbackManager::new(),
            queue,
            book: Mutex::new(Bookkeeping::default()),
            hold_timeout: config.hold_timeout(),
            closed: AtomicBool::new(false),
            observer,
        });
        tokio::spawn(run_worker(Arc::downgrade(&inner), rx));
        info!(
            storage_key = %inner.storage_key,
            crdt_key = %inner.crdt_key,
            "reference-mode store opened"
        );
        Ok(Self { inner })
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.inner.storage_key
    }

    pub fn kind(&self) -> ContainerKind {
        self.inner.kind
    }

    /// The actor this store writes synthesized entity versions under.
    pub fn crdt_key(&self) -> &Actor {
        &self.inner.crdt_key
    }

    pub fn container(&self) -> &DirectStore<CrdtContainer<Reference>> {
        &self.inner.container
    }

    pub fn backing(&self) -> &DirectStoreMuxer<CrdtEntity> {
        &self.inner.backing
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sends currently held back waiting for backing data.
    pub fn held_sends(&self) -> usize {
        self.inner.book.lock().expect("bookkeeping lock poisoned").holds.len()
    }

    pub async fn on(&self, callback: Arc<dyn Callback<RefModeMessage>>) -> StoreResult<CallbackId> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.storage_key.clone()));
        }
        Ok(self.inner.callbacks.register(callback))
    }

    /// Unregister a callback. Once none remain the backing store's cache is
    /// released after the queued work drains.
    pub async fn off(&self, id: CallbackId) {
        self.inner.callbacks.unregister(id);
        if self.inner.callbacks.is_empty() {
            self.inner.queue.push(Work::ReleaseCaches);
        }
    }

    pub async fn on_proxy_message(&self, message: RefModeMessage) -> StoreResult<bool> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(StoreError::Closed(inner.storage_key.clone()));
        }
        observer::notify(
            inner.observer.as_ref(),
            &ObservedMessage {
                boundary: Boundary::ReferenceModeStore,
                storage_key: &inner.storage_key,
                kind: message.kind(),
                sender: message.id(),
                mux_id: None,
                message: &message,
            },
        );
        let (reply, answer) = oneshot::channel();
        if !inner.queue.push(Work::Proxy { message, reply }) {
            return Err(StoreError::Closed(inner.storage_key.clone()));
        }
        answer
            .await
            .unwrap_or_else(|_| Err(StoreError::Closed(inner.storage_key.clone())))
    }

    /// Wait until the receive queue is empty and both child stores are idle.
    /// Sends held for backing data do not count.
    pub async fn idle(&self) {
        let inner = &self.inner;
        loop {
            inner.queue.drained().await;
            inner.container.idle().await;
            inner.backing.idle().await;
            if inner.queue.depth() == 0 {
                break;
            }
        }
    }

    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut book = inner.book.lock().expect("bookkeeping lock poisoned");
            for (_, timer) in book.timers.drain() {
                timer.abort();
            }
            book.holds.clear();
            book.sends.clear();
            book.pins.clear();
        }
        inner.container.close().await;
        inner.backing.close().await;
        inner.callbacks.clear();
        info!(storage_key = %inner.storage_key, "reference-mode store closed");
    }
}

async fn run_worker(store: Weak<RmsInner>, mut rx: mpsc::UnboundedReceiver<Work>) {
    while let Some(work) = rx.recv().await {
        let Some(inner) = store.upgrade() else {
            break;
        };
        inner.handle(work).await;
        inner.dispatch().await;
        inner.queue.done();
    }
}

fn container_op<T>(
    kind: ContainerKind,
    op: SetOp<T>,
    singleton: impl FnOnce() -> SingletonOp<T>,
) -> ContainerOp<T> {
    match kind {
        ContainerKind::Collection => ContainerOp::Collection(op),
        ContainerKind::Singleton => ContainerOp::Singleton(singleton()),
    }
}

/// Whether proxies can only learn about `op` through a full model.
fn needs_full_model(op: &ContainerOp<Reference>) -> bool {
    matches!(
        op,
        ContainerOp::Collection(SetOp::FastForward { .. } | SetOp::Clear { .. })
            | ContainerOp::Singleton(SingletonOp::Clear { .. })
    )
}

/// The reference an operation makes the container point at, if any.
fn referenced(op: &ContainerOp<Reference>) -> Option<&Reference> {
    match op {
        ContainerOp::Collection(SetOp::Add { added, .. }) => Some(added),
        ContainerOp::Singleton(SingletonOp::Update { value, .. }) => Some(value),
        _ => None,
    }
}

/// The backing version a reference needs. A reference without a version
/// only needs the entity to exist, which the empty map stands for.
fn required_version(reference: &Reference) -> VersionMap {
    reference.version.clone().unwrap_or_default()
}

impl RmsInner {
    async fn handle(&self, work: Work) {
        if self.closed.load(Ordering::Acquire) {
            if let Work::Proxy { reply, .. } = work {
                let _ = reply.send(Err(StoreError::Closed(self.storage_key.clone())));
            }
            return;
        }
        match work {
            Work::Proxy { message, reply } => {
                let result = self.handle_proxy(message).await;
                if let Err(e) = &result {
                    debug!(storage_key = %self.storage_key, error = %e, "proxy message failed");
                }
                let _ = reply.send(result);
            }
            Work::Container(message) => {
                if let Err(e) = self.handle_container(message).await {
                    error!(
                        storage_key = %self.storage_key,
                        error = %e,
                        "failed to handle container update"
                    );
                }
            }
            Work::Backing(message) => {
                if let Err(e) = self.handle_backing(message).await {
                    error!(
                        storage_key = %self.storage_key,
                        error = %e,
                        "failed to handle backing update"
                    );
                }
            }
            Work::HoldExpired(block) => {
                if let Err(e) = self.handle_hold_expired(block).await {
                    error!(
                        storage_key = %self.storage_key,
                        block,
                        error = %e,
                        "hold recovery failed"
                    );
                }
            }
            Work::ReleaseCaches => {
                if self.callbacks.is_empty() {
                    self.backing.clear_stores_cache().await;
                }
            }
        }
    }

    async fn handle_proxy(&self, message: RefModeMessage) -> StoreResult<bool> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                let to = id.ok_or_else(|| StoreError::MissingSender(self.storage_key.clone()))?;
                self.answer_sync(to).await?;
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                for op in &operations {
                    self.check_kind(op.kind())?;
                }
                for op in operations.iter().cloned() {
                    if !self.write_operation(op).await? {
                        debug!(
                            storage_key = %self.storage_key,
                            sender = ?id,
                            "container rejected operation"
                        );
                        return Ok(false);
                    }
                }
                if !operations.is_empty() {
                    self.enqueue(
                        PendingSend::Forward {
                            message: ProxyMessage::Operations { operations, id: None },
                            except: id,
                        },
                        BTreeMap::new(),
                    )
                    .await;
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                self.check_kind(model.kind())?;
                let data = model.set_data();
                let mut references = SetData {
                    version_map: data.version_map.clone(),
                    values: BTreeMap::new(),
                };
                for (ref_id, value) in &data.values {
                    let reference = self.write_entity(&value.value).await?;
                    let value = DataValue::new(value.version_map.clone(), reference);
                    references.values.insert(ref_id.clone(), value);
                }
                let accepted = self
                    .container
                    .on_proxy_message(ProxyMessage::ModelUpdate {
                        model: model.with_set_data(references),
                        id: Some(self.container_id),
                    })
                    .await?;
                self.prune_versions();
                self.enqueue(
                    PendingSend::Forward {
                        message: ProxyMessage::ModelUpdate { model, id: None },
                        except: id,
                    },
                    BTreeMap::new(),
                )
                .await;
                Ok(accepted)
            }
        }
    }

    fn check_kind(&self, kind: ContainerKind) -> StoreResult<()> {
        if kind != self.kind {
            return Err(StoreError::UnsupportedMessage {
                storage_key: self.storage_key.clone(),
                reason: format!("expected {:?} data, got {kind:?}", self.kind),
            });
        }
        Ok(())
    }

    /// Apply one proxy operation: entity writes go to the backing store
    /// first, then the matching reference operation to the container.
    /// Entities the container drops are cleared in the backing store after.
    async fn write_operation(&self, op: RefModeOp) -> StoreResult<bool> {
        let before = self.container.local_data();
        let (op, removes) = match op {
            ContainerOp::Collection(SetOp::Add { actor, clock, added }) => {
                let added = self.write_entity(&added).await?;
                (ContainerOp::Collection(SetOp::Add { actor, clock, added }), false)
            }
            ContainerOp::Collection(SetOp::Remove { actor, clock, removed }) => {
                let removed = self.bare_reference(&removed.id);
                (ContainerOp::Collection(SetOp::Remove { actor, clock, removed }), true)
            }
            ContainerOp::Collection(SetOp::Clear { actor, clock }) => {
                (ContainerOp::Collection(SetOp::Clear { actor, clock }), true)
            }
            ContainerOp::Collection(SetOp::FastForward {
                old_clock,
                new_clock,
                added,
                removed,
            }) => {
                let mut references = Vec::with_capacity(added.len());
                for entry in added {
                    let reference = self.write_entity(&entry.value).await?;
                    references.push(DataValue::new(entry.version_map, reference));
                }
                let removed = removed.iter().map(|e| self.bare_reference(&e.id)).collect();
                let op = SetOp::FastForward {
                    old_clock,
                    new_clock,
                    added: references,
                    removed,
                };
                (ContainerOp::Collection(op), true)
            }
            ContainerOp::Singleton(SingletonOp::Update { actor, clock, value }) => {
                let value = self.write_entity(&value).await?;
                (ContainerOp::Singleton(SingletonOp::Update { actor, clock, value }), false)
            }
            ContainerOp::Singleton(SingletonOp::Clear { actor, clock }) => {
                (ContainerOp::Singleton(SingletonOp::Clear { actor, clock }), true)
            }
        };
        let accepted = self
            .container
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![op],
                id: Some(self.container_id),
            })
            .await?;
        if accepted && removes {
            let after = self.container.local_data();
            let dropped: Vec<ReferenceId> = before
                .set_data()
                .values
                .keys()
                .filter(|id| !after.set_data().values.contains_key(*id))
                .cloned()
                .collect();
            for id in dropped {
                self.clear_entity(&id).await?;
            }
            self.prune_versions();
        }
        Ok(accepted)
    }

    fn bare_reference(&self, id: &str) -> Reference {
        Reference::new(id, self.backing_key.clone(), None)
    }

    /// Write `entity` to the backing store unless it already holds exactly
    /// this content, and return a reference at the version it now holds.
    async fn write_entity(&self, entity: &RawEntity) -> StoreResult<Reference> {
        let existing = self.backing.local_data(&entity.id).await?;
        if !existing.version_map.is_empty() && existing.to_raw(&entity.id) == *entity {
            return Ok(Reference::new(
                entity.id.clone(),
                self.backing_key.clone(),
                Some(existing.version_map),
            ));
        }
        let data = self.synthesize(entity, &existing);
        self.backing
            .on_proxy_message(MuxedProxyMessage::new(
                entity.id.clone(),
                ProxyMessage::ModelUpdate {
                    model: data,
                    id: Some(self.backing_id),
                },
            ))
            .await?;
        let version = self.backing.local_data(&entity.id).await?.version_map;
        Ok(Reference::new(entity.id.clone(), self.backing_key.clone(), Some(version)))
    }

    /// Entity data for `entity` whose field clocks dominate both `existing`
    /// and every earlier write from this store.
    fn synthesize(&self, entity: &RawEntity, existing: &EntityData) -> EntityData {
        let mut book = self.book.lock().expect("bookkeeping lock poisoned");
        let counters = book.versions.entry(entity.id.clone()).or_default();
        let fields: BTreeSet<&FieldName> =
            entity.singletons.keys().chain(entity.collections.keys()).collect();
        let mut field_versions: HashMap<FieldName, VersionMap> = HashMap::new();
        let mut version_map = existing.version_map.clone();
        for field in fields {
            let previous = existing
                .singletons
                .get(field)
                .or_else(|| existing.collections.get(field))
                .map(|data| data.version_map.clone())
                .unwrap_or_default();
            let counter = counters.entry(field.clone()).or_insert(0);
            *counter = (*counter).max(previous.get(&self.crdt_key)) + 1;
            let mut clock = previous;
            clock.set(self.crdt_key.clone(), *counter);
            version_map.merge_in(&clock);
            field_versions.insert(field.clone(), clock);
        }
        EntityData::from_raw(entity, version_map, |field| {
            field_versions.get(field).cloned().unwrap_or_default()
        })
    }

    async fn clear_entity(&self, id: &str) -> StoreResult<()> {
        let existing = self.backing.local_data(id).await?;
        if existing.version_map.is_empty() {
            return Ok(());
        }
        let op = EntityOp::ClearAll {
            actor: self.crdt_key.clone(),
            clock: existing.version_map,
        };
        self.backing
            .on_proxy_message(MuxedProxyMessage::new(
                id,
                ProxyMessage::Operations {
                    operations: vec![op],
                    id: Some(self.backing_id),
                },
            ))
            .await?;
        Ok(())
    }

    /// Forget synthesized versions of entities the container no longer holds.
    fn prune_versions(&self) {
        let data = self.container.local_data();
        let present = &data.set_data().values;
        let mut book = self.book.lock().expect("bookkeeping lock poisoned");
        book.versions.retain(|id, _| present.contains_key(id));
    }

    async fn handle_container(&self, message: ContainerMessage) -> StoreResult<()> {
        match message {
            ProxyMessage::SyncRequest { .. } => {
                self.enqueue(PendingSend::SyncRequest, BTreeMap::new()).await
            }
            ProxyMessage::ModelUpdate { model, .. } => {
                let waiting = self.missing(&model).await?;
                self.enqueue(PendingSend::Broadcast { data: model }, waiting).await;
            }
            ProxyMessage::Operations { operations, .. } => {
                if operations.iter().any(needs_full_model) {
                    let data = self.container.local_data();
                    let waiting = self.missing(&data).await?;
                    self.enqueue(PendingSend::Broadcast { data }, waiting).await;
                } else {
                    for op in operations {
                        let mut waiting = BTreeMap::new();
                        if let Some(reference) = referenced(&op) {
                            let required = required_version(reference);
                            if self.is_missing(&reference.id, &required).await? {
                                waiting.insert(reference.id.clone(), required);
                            }
                        }
                        self.enqueue(PendingSend::Operation(op), waiting).await;
                    }
                }
            }
        }
        self.prune_versions();
        Ok(())
    }

    async fn handle_backing(&self, message: BackingMessage) -> StoreResult<()> {
        let MuxedProxyMessage { mux_id, message } = message;
        if let ProxyMessage::SyncRequest { .. } = message {
            warn!(
                storage_key = %self.storage_key,
                mux_id = %mux_id,
                "ignoring sync request from backing store"
            );
            return Ok(());
        }
        let version = self.backing.local_data(&mux_id).await?.version_map;
        let pins = {
            let mut book = self.book.lock().expect("bookkeeping lock poisoned");
            let mut pins = Vec::new();
            for block in book.holds.notify(&mux_id, &version) {
                pins.extend(book.release(block));
                debug!(
                    storage_key = %self.storage_key,
                    mux_id = %mux_id,
                    block,
                    "held send released"
                );
            }
            pins
        };
        self.unpin(pins).await;
        Ok(())
    }

    async fn unpin(&self, ids: Vec<ReferenceId>) {
        for id in ids {
            self.backing.unpin(&id).await;
        }
    }

    async fn handle_hold_expired(&self, block: BlockId) -> StoreResult<()> {
        let waiting = {
            let book = self.book.lock().expect("bookkeeping lock poisoned");
            book.holds.waiting(block).cloned()
        };
        let Some(waiting) = waiting else {
            return Ok(());
        };
        // Read the backing store directly before giving up on it.
        let mut caught_up = true;
        for (id, required) in &waiting {
            if self.is_missing(id, required).await.unwrap_or(true) {
                caught_up = false;
                break;
            }
        }
        if caught_up {
            let pins = self.book.lock().expect("bookkeeping lock poisoned").release(block);
            self.unpin(pins).await;
            debug!(storage_key = %self.storage_key, block, "held send released at timeout");
            return Ok(());
        }
        let (cancelled, pins) = {
            let mut book = self.book.lock().expect("bookkeeping lock poisoned");
            book.timers.remove(&block);
            book.holds.remove(block);
            (book.sends.cancel(block), book.pins.remove(&block).unwrap_or_default())
        };
        self.unpin(pins).await;
        let Some(send) = cancelled else {
            return Ok(());
        };
        warn!(
            storage_key = %self.storage_key,
            block,
            timeout_ms = self.hold_timeout.as_millis() as u64,
            "backing data did not arrive in time; clearing container"
        );
        self.clear_container().await?;
        match send {
            PendingSend::Reply { to, .. } => self.answer_sync(to).await,
            _ => {
                let data = self.container.local_data();
                let waiting = self.missing(&data).await?;
                self.enqueue(PendingSend::Broadcast { data }, waiting).await;
                Ok(())
            }
        }
    }

    async fn clear_container(&self) -> StoreResult<()> {
        let data = self.container.local_data();
        let actor = Actor::new(format!("{}::clear", self.crdt_key));
        let clock = data.set_data().version_map.clone();
        let op = container_op(
            self.kind,
            SetOp::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
            || SingletonOp::Clear { actor, clock },
        );
        self.container
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![op],
                id: Some(self.container_id),
            })
            .await?;
        self.prune_versions();
        Ok(())
    }

    async fn answer_sync(&self, to: CallbackId) -> StoreResult<()> {
        let data = self.container.local_data();
        let waiting = self.missing(&data).await?;
        self.enqueue(PendingSend::Reply { to, data }, waiting).await;
        Ok(())
    }

    /// References in `data` the backing store cannot serve yet.
    async fn missing(
        &self,
        data: &ContainerData<Reference>,
    ) -> StoreResult<BTreeMap<ReferenceId, VersionMap>> {
        let mut waiting = BTreeMap::new();
        for (id, value) in &data.set_data().values {
            let required = required_version(&value.value);
            if self.is_missing(id, &required).await? {
                waiting.insert(id.clone(), required);
            }
        }
        Ok(waiting)
    }

    async fn is_missing(&self, id: &str, required: &VersionMap) -> StoreResult<bool> {
        let held = self.backing.local_data(id).await?.version_map;
        Ok(!super::hold::satisfies(&held, required))
    }

    /// Queue `send`, held until the backing store holds every entry of
    /// `waiting`. Waited-on children are pinned open so their updates arrive.
    async fn enqueue(&self, send: PendingSend, waiting: BTreeMap<ReferenceId, VersionMap>) {
        let mut missing = BTreeMap::new();
        let mut pins = Vec::new();
        for (id, required) in waiting {
            let pinned = match self.backing.pin(&id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        storage_key = %self.storage_key,
                        mux_id = %id,
                        error = %e,
                        "failed to pin backing store"
                    );
                    false
                }
            };
            // Reopening a child may have loaded the version it waits for.
            if self.is_missing(&id, &required).await.unwrap_or(true) {
                if pinned {
                    pins.push(id.clone());
                }
                missing.insert(id, required);
            } else if pinned {
                self.backing.unpin(&id).await;
            }
        }
        let mut book = self.book.lock().expect("bookkeeping lock poisoned");
        if missing.is_empty() {
            book.sends.enqueue(send);
            return;
        }
        let block = book.next_block;
        book.next_block += 1;
        debug!(
            storage_key = %self.storage_key,
            block,
            waiting = ?missing.keys().collect::<Vec<_>>(),
            "holding send for backing data"
        );
        book.holds.hold(block, missing);
        book.pins.insert(block, pins);
        book.sends.enqueue_blocking(block, send);
        let queue = self.queue.clone();
        let timeout = self.hold_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.push(Work::HoldExpired(block));
        });
        book.timers.insert(block, timer.abort_handle());
    }

    /// Deliver every send that is ready, in order.
    async fn dispatch(&self) {
        loop {
            let ready = self.book.lock().expect("bookkeeping lock poisoned").sends.drain_ready();
            if ready.is_empty() {
                return;
            }
            for send in ready {
                if let Err(e) = self.deliver(send).await {
                    error!(
                        storage_key = %self.storage_key,
                        error = %e,
                        "failed to deliver to proxies"
                    );
                }
            }
        }
    }

    async fn deliver(&self, send: PendingSend) -> StoreResult<()> {
        match send {
            PendingSend::Forward { message, except } => self.callbacks.send(message, except).await,
            PendingSend::Reply { to, data } => {
                let model = self.entities(&data).await?;
                self.callbacks
                    .send_to(to, ProxyMessage::ModelUpdate { model, id: Some(to) })
                    .await;
            }
            PendingSend::Broadcast { data } => {
                let model = self.entities(&data).await?;
                self.callbacks.send(ProxyMessage::ModelUpdate { model, id: None }, None).await;
            }
            PendingSend::Operation(op) => {
                let op = self.entity_op(op).await?;
                self.callbacks
                    .send(
                        ProxyMessage::Operations {
                            operations: vec![op],
                            id: None,
                        },
                        None,
                    )
                    .await;
            }
            PendingSend::SyncRequest => {
                self.callbacks.send(ProxyMessage::SyncRequest { id: None }, None).await
            }
        }
        Ok(())
    }

    async fn entity(&self, id: &str) -> StoreResult<RawEntity> {
        Ok(self.backing.local_data(id).await?.to_raw(id))
    }

    /// Rebuild proxy-facing data from container data and backing entities.
    async fn entities(&self, data: &ContainerData<Reference>) -> StoreResult<RefModeData> {
        let references = data.set_data();
        let mut entities = SetData {
            version_map: references.version_map.clone(),
            values: BTreeMap::new(),
        };
        for (id, value) in &references.values {
            let entity = self.entity(id).await?;
            entities
                .values
                .insert(id.clone(), DataValue::new(value.version_map.clone(), entity));
        }
        Ok(data.with_set_data(entities))
    }

    async fn entity_op(&self, op: ContainerOp<Reference>) -> StoreResult<RefModeOp> {
        Ok(match op {
            ContainerOp::Collection(SetOp::Add { actor, clock, added }) => {
                ContainerOp::Collection(SetOp::Add {
                    actor,
                    clock,
                    added: self.entity(&added.id).await?,
                })
            }
            ContainerOp::Collection(SetOp::Remove { actor, clock, removed }) => {
                ContainerOp::Collection(SetOp::Remove {
                    actor,
                    clock,
                    removed: RawEntity::new(removed.id),
                })
            }
            ContainerOp::Collection(SetOp::Clear { actor, clock }) => {
                ContainerOp::Collection(SetOp::Clear { actor, clock })
            }
            ContainerOp::Collection(SetOp::FastForward {
                old_clock,
                new_clock,
                added,
                removed,
            }) => {
                let mut entities = Vec::with_capacity(added.len());
                for entry in added {
                    let entity = self.entity(&entry.value.id).await?;
                    entities.push(DataValue::new(entry.version_map, entity));
                }
                ContainerOp::Collection(SetOp::FastForward {
                    old_clock,
                    new_clock,
                    added: entities,
                    removed: removed.into_iter().map(|r| RawEntity::new(r.id)).collect(),
                })
            }
            ContainerOp::Singleton(SingletonOp::Update { actor, clock, value }) => {
                ContainerOp::Singleton(SingletonOp::Update {
                    actor,
                    clock,
                    value: self.entity(&value.id).await?,
                })
            }
            ContainerOp::Singleton(SingletonOp::Clear { actor, clock }) => {
                ContainerOp::Singleton(SingletonOp::Clear { actor, clock })
            }
        })
    }
}

#[async_trait]
impl ActiveStore<RefModeData, RefModeOp> for ReferenceModeStore {
    fn storage_key(&self) -> StorageKey {
        self.inner.storage_key.clone()
    }

    async fn on(&self, callback: Arc<dyn Callback<RefModeMessage>>) -> StoreResult<CallbackId> {
        ReferenceModeStore::on(self, callback).await
    }

    async fn off(&self, id: CallbackId) {
        ReferenceModeStore::off(self, id).await
    }

    async fn on_proxy_message(&self, message: RefModeMessage) -> StoreResult<bool> {
        ReferenceModeStore::on_proxy_message(self, message).await
    }

    async fn idle(&self) {
        ReferenceModeStore::idle(self).await
    }

    async fn close(&self) {
        ReferenceModeStore::close(self).await
    }
}
