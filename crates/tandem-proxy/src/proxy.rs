use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use tandem_crdt::{CrdtModel, CrdtOperation};
use tandem_store::{callback_fn, ActiveStore, CallbackId, ProxyMessage, StoreResult};
use tandem_types::{StorageKey, VersionMap};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::handles::{Action, ErrorCallback, EventAction, HandleId, Handles, Signal, UpdateAction};
use crate::scheduler::Scheduler;
use crate::state::ProxyState;

/// Whether a proxy reads as well as writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyMode {
    #[default]
    ReadWrite,
    /// Sends operations to the store but never syncs, reads or notifies.
    WriteOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    pub mode: ProxyMode,
}

impl ProxyOptions {
    pub fn write_only() -> Self {
        Self {
            mode: ProxyMode::WriteOnly,
        }
    }
}

/// The store's verdict on a local write.
///
/// Local writes apply immediately; the store sees them asynchronously. Await
/// [`WriteAck::accepted`] to learn whether the store applied them too.
pub struct WriteAck {
    storage_key: StorageKey,
    rx: Option<oneshot::Receiver<StoreResult<bool>>>,
}

impl WriteAck {
    fn rejected(storage_key: StorageKey) -> Self {
        Self { storage_key, rx: None }
    }

    /// `Ok(false)` when the operations did not apply locally, or the store
    /// could not apply them and asked for a resync.
    pub async fn accepted(self) -> ProxyResult<bool> {
        let Some(rx) = self.rx else {
            return Ok(false);
        };
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Closed(self.storage_key)),
        }
    }
}

type Message<M> = ProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Op>;
type Store<M> = Arc<dyn ActiveStore<<M as CrdtModel>::Data, <M as CrdtModel>::Op>>;

struct Outbound<M: CrdtModel> {
    message: Message<M>,
    ack: Option<oneshot::Sender<StoreResult<bool>>>,
}

struct Core<M: CrdtModel> {
    model: M,
    state: ProxyState,
    /// Operations from the store that arrived while a sync was in flight.
    post_sync: Vec<M::Op>,
    first_update_sent: bool,
}

/// A client-side copy of a CRDT model kept in sync with one store.
///
/// Local writes apply to the copy first and are then sent to the store in
/// order. Messages from the store are merged as they arrive. Handle callbacks
/// run on a per-proxy scheduler and never on the caller's or store's task.
pub struct StorageProxy<M: CrdtModel> {
    inner: Arc<ProxyInner<M>>,
}

impl<M: CrdtModel> Clone for StorageProxy<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ProxyInner<M: CrdtModel> {
    storage_key: StorageKey,
    mode: ProxyMode,
    store: Store<M>,
    callback_id: OnceLock<CallbackId>,
    core: Mutex<Core<M>>,
    state: watch::Sender<ProxyState>,
    handles: Mutex<Handles<M::Consumer>>,
    errors: Arc<RwLock<Option<ErrorCallback>>>,
    scheduler: Scheduler,
    outbox: Mutex<Option<mpsc::UnboundedSender<Outbound<M>>>>,
    in_flight: Arc<watch::Sender<usize>>,
    closed: AtomicBool,
}

impl<M: CrdtModel> StorageProxy<M> {
    /// Attach a proxy holding `crdt` to `store`.
    pub async fn new(store: Store<M>, crdt: M, options: ProxyOptions) -> ProxyResult<Self> {
        let storage_key = store.storage_key();
        let errors = Arc::new(RwLock::new(None));
        let (outbox, rx) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);
        let in_flight = Arc::new(in_flight);
        let (state, _) = watch::channel(ProxyState::NoSync);

        let inner = Arc::new(ProxyInner {
            storage_key: storage_key.clone(),
            mode: options.mode,
            store: Arc::clone(&store),
            callback_id: OnceLock::new(),
            core: Mutex::new(Core {
                model: crdt,
                state: ProxyState::NoSync,
                post_sync: Vec::new(),
                first_update_sent: false,
            }),
            state,
            handles: Mutex::new(Handles::default()),
            errors: Arc::clone(&errors),
            scheduler: Scheduler::new(storage_key.clone(), errors),
            outbox: Mutex::new(Some(outbox)),
            in_flight: Arc::clone(&in_flight),
            closed: AtomicBool::new(false),
        });

        let weak: Weak<ProxyInner<M>> = Arc::downgrade(&inner);
        let id = store
            .on(callback_fn(move |message: Message<M>| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_message(message);
                    }
                }
            }))
            .await?;
        let _ = inner.callback_id.set(id);
        tokio::spawn(pump::<M>(store, rx, in_flight));
        debug!(
            storage_key = %storage_key,
            callback_id = id,
            mode = ?options.mode,
            "proxy attached"
        );
        Ok(Self { inner })
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.inner.storage_key
    }

    pub fn mode(&self) -> ProxyMode {
        self.inner.mode
    }

    pub fn state(&self) -> ProxyState {
        self.inner.core().state
    }

    pub fn version_map(&self) -> VersionMap {
        self.inner.core().model.version_map()
    }

    /// A copy of the local model's data.
    pub fn data(&self) -> M::Data {
        self.inner.core().model.data()
    }

    /// Announce that a reader is attached. Sync starts on
    /// [`maybe_initiate_sync`](Self::maybe_initiate_sync).
    pub fn prepare_for_sync(&self) -> ProxyResult<()> {
        self.inner.check_open()?;
        self.inner.check_readable_mode()?;
        let mut core = self.inner.core();
        if core.state == ProxyState::NoSync {
            self.inner.set_state(&mut core, ProxyState::ReadyToSync);
        }
        Ok(())
    }

    /// Request the store's model if no sync has been requested yet.
    pub fn maybe_initiate_sync(&self) -> ProxyResult<()> {
        self.inner.check_open()?;
        if self.inner.mode == ProxyMode::WriteOnly {
            return Ok(());
        }
        let mut core = self.inner.core();
        if matches!(core.state, ProxyState::NoSync | ProxyState::ReadyToSync) {
            self.inner.set_state(&mut core, ProxyState::AwaitingSync);
            self.inner.request_sync();
        }
        Ok(())
    }

    /// Apply `ops` locally and forward them to the store. Either every
    /// operation applies or none does and nothing is sent.
    pub fn apply_ops(&self, ops: Vec<M::Op>) -> ProxyResult<WriteAck> {
        let inner = &self.inner;
        inner.check_open()?;
        let mut core = inner.core();
        let old = core.model.consumer_view();
        let mut candidate = M::from_data(core.model.data());
        if !ops.iter().all(|op| candidate.apply_operation(op)) {
            debug!(storage_key = %inner.storage_key, "local operations did not apply");
            return Ok(WriteAck::rejected(inner.storage_key.clone()));
        }
        core.model = candidate;
        let (ack, rx) = oneshot::channel();
        inner.send(
            ProxyMessage::Operations {
                operations: ops,
                id: inner.id(),
            },
            Some(ack),
        )?;
        if core.state.notifies_local_writes() {
            let new = core.model.consumer_view();
            inner.notify_update(&mut core, old, new);
        }
        Ok(WriteAck {
            storage_key: inner.storage_key.clone(),
            rx: Some(rx),
        })
    }

    pub fn apply_op(&self, op: M::Op) -> ProxyResult<WriteAck> {
        self.apply_ops(vec![op])
    }

    /// The synced value, starting a sync and waiting for it when needed.
    pub async fn value(&self) -> ProxyResult<M::Consumer> {
        let inner = &self.inner;
        inner.check_readable_mode()?;
        let mut state = inner.state.subscribe();
        {
            let core = inner.core();
            match core.state {
                ProxyState::Closed => return Err(ProxyError::Closed(inner.storage_key.clone())),
                ProxyState::NoSync => {
                    return Err(ProxyError::NotSyncing {
                        storage_key: inner.storage_key.clone(),
                        state: core.state,
                    })
                }
                s if s.is_readable() => return Ok(core.model.consumer_view()),
                _ => {}
            }
        }
        self.maybe_initiate_sync()?;
        let reached = state
            .wait_for(|s| s.is_readable() || *s == ProxyState::Closed)
            .await
            .map(|s| *s);
        match reached {
            Ok(s) if s.is_readable() => Ok(inner.core().model.consumer_view()),
            _ => Err(ProxyError::Closed(inner.storage_key.clone())),
        }
    }

    /// The synced value, without waiting.
    pub fn value_now(&self) -> ProxyResult<M::Consumer> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.check_readable_mode()?;
        let core = inner.core();
        if !core.state.is_readable() {
            return Err(ProxyError::NotSynced {
                storage_key: inner.storage_key.clone(),
                state: core.state,
            });
        }
        Ok(core.model.consumer_view())
    }

    /// Run `action` once the proxy syncs, or right away if it already has.
    pub fn add_on_ready(
        &self,
        id: HandleId,
        action: impl Fn() + Send + Sync + 'static,
    ) -> ProxyResult<()> {
        self.add_signal(Signal::Ready, ProxyState::Sync, id, Arc::new(action))
    }

    pub fn add_on_update(
        &self,
        id: HandleId,
        action: impl Fn(&M::Consumer, &M::Consumer) + Send + Sync + 'static,
    ) -> ProxyResult<()> {
        self.inner.check_listener()?;
        let action: UpdateAction<M::Consumer> = Arc::new(action);
        self.inner.handles().add_update(id, action);
        Ok(())
    }

    /// Run `action` whenever the proxy desyncs, or right away if it is
    /// desynced now.
    pub fn add_on_desync(
        &self,
        id: HandleId,
        action: impl Fn() + Send + Sync + 'static,
    ) -> ProxyResult<()> {
        self.add_signal(Signal::Desync, ProxyState::Desync, id, Arc::new(action))
    }

    pub fn add_on_resync(
        &self,
        id: HandleId,
        action: impl Fn() + Send + Sync + 'static,
    ) -> ProxyResult<()> {
        self.inner.check_listener()?;
        self.inner.handles().add(Signal::Resync, id, Arc::new(action));
        Ok(())
    }

    pub fn register_for_storage_events(
        &self,
        id: HandleId,
        action: impl Fn(crate::StorageEvent) + Send + Sync + 'static,
    ) -> ProxyResult<()> {
        self.inner.check_open()?;
        let action: EventAction = Arc::new(action);
        self.inner.handles().add_events(id, action);
        Ok(())
    }

    /// Set where callback panics are reported. Only the first call has effect.
    pub fn set_error_callback(&self, callback: impl Fn(ProxyError) + Send + Sync + 'static) {
        let mut errors = self.inner.errors.write().expect("error callback lock poisoned");
        if errors.is_none() {
            *errors = Some(Arc::new(callback));
        }
    }

    pub fn remove_callbacks_for(&self, id: &HandleId) {
        self.inner.handles().remove(id);
    }

    fn add_signal(
        &self,
        signal: Signal,
        fires_in: ProxyState,
        id: HandleId,
        action: Action,
    ) -> ProxyResult<()> {
        let inner = &self.inner;
        inner.check_listener()?;
        let core = inner.core();
        if core.state == fires_in {
            inner.scheduler.schedule(vec![signal.invoke(&id, &action)]);
        }
        inner.handles().add(signal, id, action);
        Ok(())
    }

    /// Resolve once nothing is waiting to reach the store, the store is idle
    /// and every scheduled callback has run.
    pub async fn idle(&self) {
        let inner = &self.inner;
        loop {
            let mut in_flight = inner.in_flight.subscribe();
            let _ = in_flight.wait_for(|n| *n == 0).await;
            inner.store.idle().await;
            inner.scheduler.idle().await;
            if *inner.in_flight.borrow() == 0 {
                break;
            }
        }
    }

    /// Detach from the store after delivering pending writes. Further calls
    /// fail with [`ProxyError::Closed`].
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut core = inner.core();
            inner.set_state(&mut core, ProxyState::Closed);
            core.post_sync.clear();
        }
        inner.outbox.lock().expect("outbox lock poisoned").take();
        let mut in_flight = inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|n| *n == 0).await;
        if let Some(id) = inner.id() {
            inner.store.off(id).await;
        }
        inner.scheduler.shutdown();
        inner.handles().clear();
        info!(storage_key = %inner.storage_key, "proxy closed");
    }
}

impl<M: CrdtModel> ProxyInner<M> {
    fn core(&self) -> std::sync::MutexGuard<'_, Core<M>> {
        self.core.lock().expect("proxy model lock poisoned")
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Handles<M::Consumer>> {
        self.handles.lock().expect("proxy handles lock poisoned")
    }

    fn id(&self) -> Option<CallbackId> {
        self.callback_id.get().copied()
    }

    fn check_open(&self) -> ProxyResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed(self.storage_key.clone()));
        }
        Ok(())
    }

    fn check_readable_mode(&self) -> ProxyResult<()> {
        if self.mode == ProxyMode::WriteOnly {
            return Err(ProxyError::WriteOnly(self.storage_key.clone()));
        }
        Ok(())
    }

    /// Listeners need a proxy that will sync.
    fn check_listener(&self) -> ProxyResult<()> {
        self.check_open()?;
        self.check_readable_mode()?;
        let state = self.core().state;
        if state == ProxyState::NoSync {
            return Err(ProxyError::NotSyncing {
                storage_key: self.storage_key.clone(),
                state,
            });
        }
        Ok(())
    }

    fn set_state(&self, core: &mut Core<M>, state: ProxyState) {
        if core.state != state {
            debug!(storage_key = %self.storage_key, from = %core.state, to = %state, "proxy state");
        }
        core.state = state;
        self.state.send_replace(state);
    }

    fn send(
        &self,
        message: Message<M>,
        ack: Option<oneshot::Sender<StoreResult<bool>>>,
    ) -> ProxyResult<()> {
        let outbox = self.outbox.lock().expect("outbox lock poisoned");
        let Some(outbox) = outbox.as_ref() else {
            return Err(ProxyError::Closed(self.storage_key.clone()));
        };
        self.in_flight.send_modify(|n| *n += 1);
        if outbox.send(Outbound { message, ack }).is_err() {
            self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
            return Err(ProxyError::Closed(self.storage_key.clone()));
        }
        Ok(())
    }

    fn request_sync(&self) {
        debug!(storage_key = %self.storage_key, "requesting sync");
        if let Err(e) = self.send(ProxyMessage::SyncRequest { id: self.id() }, None) {
            debug!(storage_key = %self.storage_key, error = %e, "sync request not sent");
        }
    }

    /// Handle a message from the store. Runs on the store's delivery path,
    /// so it only touches local state and queues work.
    fn on_message(&self, message: Message<M>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match message {
            ProxyMessage::SyncRequest { .. } => {
                let data = self.core().model.data();
                if let Err(e) = self.send(
                    ProxyMessage::ModelUpdate {
                        model: data,
                        id: self.id(),
                    },
                    None,
                ) {
                    debug!(
                        storage_key = %self.storage_key,
                        error = %e,
                        "could not answer sync request"
                    );
                }
            }
            ProxyMessage::ModelUpdate { .. } | ProxyMessage::Operations { .. }
                if self.mode == ProxyMode::WriteOnly =>
            {
                debug!(
                    storage_key = %self.storage_key,
                    kind = message.kind().name(),
                    "write-only proxy ignoring store update"
                );
            }
            ProxyMessage::ModelUpdate { model, .. } => self.process_model_update(model),
            ProxyMessage::Operations { operations, .. } => {
                let mut core = self.core();
                self.process_ops(&mut core, operations);
            }
        }
    }

    fn process_model_update(&self, model: M::Data) {
        let mut core = self.core();
        let prior = core.state;
        if prior.ignores_model_updates() {
            debug!(
                storage_key = %self.storage_key,
                state = %prior,
                "ignoring model update before sync"
            );
            return;
        }
        let old = core.model.consumer_view();
        core.model.merge(model);
        self.set_state(&mut core, ProxyState::Sync);
        match prior {
            ProxyState::AwaitingSync => {
                self.notify(Signal::Ready);
                self.replay_post_sync(&mut core);
            }
            ProxyState::Sync => {
                let new = core.model.consumer_view();
                self.notify_update(&mut core, old, new);
            }
            ProxyState::Desync => {
                self.notify(Signal::Resync);
                let new = core.model.consumer_view();
                self.notify_update(&mut core, old, new);
                self.replay_post_sync(&mut core);
            }
            ProxyState::NoSync | ProxyState::ReadyToSync | ProxyState::Closed => {}
        }
    }

    fn process_ops(&self, core: &mut Core<M>, operations: Vec<M::Op>) {
        match core.state {
            ProxyState::Sync => {}
            ProxyState::AwaitingSync | ProxyState::Desync => {
                core.post_sync.extend(operations);
                return;
            }
            // The model a later sync brings covers these.
            ProxyState::NoSync | ProxyState::ReadyToSync | ProxyState::Closed => {
                debug!(
                    storage_key = %self.storage_key,
                    state = %core.state,
                    "dropping operations before sync"
                );
                return;
            }
        }
        let old = core.model.consumer_view();
        if operations.iter().all(|op| core.model.apply_operation(op)) {
            let new = core.model.consumer_view();
            self.notify_update(core, old, new);
            return;
        }
        info!(storage_key = %self.storage_key, "operations from store did not apply; resyncing");
        self.set_state(core, ProxyState::Desync);
        self.notify(Signal::Desync);
        self.request_sync();
    }

    /// Apply queued store operations minted after the synced model.
    fn replay_post_sync(&self, core: &mut Core<M>) {
        if core.post_sync.is_empty() {
            return;
        }
        let version = core.model.version_map();
        let queued = std::mem::take(&mut core.post_sync);
        let total = queued.len();
        let fresh: Vec<M::Op> = queued
            .into_iter()
            .filter(|op| op.clock().strictly_dominates(&version))
            .collect();
        debug!(
            storage_key = %self.storage_key,
            total,
            replayed = fresh.len(),
            "replaying post-sync operations"
        );
        if !fresh.is_empty() {
            self.process_ops(core, fresh);
        }
    }

    fn notify(&self, signal: Signal) {
        let batch = self.handles().signal(signal);
        self.scheduler.schedule(batch);
    }

    /// Notify update listeners unless the value hashes the same as before,
    /// which only the first update is exempt from.
    fn notify_update(&self, core: &mut Core<M>, old: M::Consumer, new: M::Consumer) {
        if core.first_update_sent && hash_of(&old) == hash_of(&new) {
            return;
        }
        core.first_update_sent = true;
        let batch = self.handles().update(Arc::new(old), Arc::new(new));
        self.scheduler.schedule(batch);
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Deliver queued messages to the store in order.
async fn pump<M: CrdtModel>(
    store: Store<M>,
    mut rx: mpsc::UnboundedReceiver<Outbound<M>>,
    in_flight: Arc<watch::Sender<usize>>,
) {
    while let Some(Outbound { message, ack }) = rx.recv().await {
        let kind = message.kind();
        let result = store.on_proxy_message(message).await;
        match ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(
                        storage_key = %store.storage_key(),
                        kind = kind.name(),
                        error = %e,
                        "store rejected proxy message"
                    );
                }
            }
        }
        in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
