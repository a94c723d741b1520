use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_crdt::{CrdtChange, CrdtModel};
use tandem_driver::{receiver_fn, Driver};
use tandem_types::{StorageKey, VersionMap};
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::state::{self, Action, Event, StoreState};
use crate::callback::{Callback, CallbackManager};
use crate::codec::{decode_model, encode_model};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::message::{CallbackId, ProxyMessage};
use crate::observer::{self, Boundary, ObservedMessage, StoreObserver};
use crate::store::{ActiveStore, StoreOptions};
use crate::write_back::WriteBack;

type Message<M> = ProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Op>;

/// Owns one CRDT model for one storage key and drives its driver.
///
/// Cloning yields another handle to the same store.
pub struct DirectStore<M: CrdtModel> {
    inner: Arc<Inner<M>>,
}

impl<M: CrdtModel> Clone for DirectStore<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Machine<D> {
    state: StoreState,
    version: u64,
    /// Driver models that arrived while another task was driving.
    pending: VecDeque<(D, u64)>,
}

struct Inner<M: CrdtModel> {
    storage_key: StorageKey,
    driver: Arc<dyn Driver>,
    model: Mutex<M>,
    machine: Mutex<Machine<M::Data>>,
    /// Held by whoever is running the state machine; at most one send is in flight.
    driving: Arc<tokio::sync::Mutex<()>>,
    settled: watch::Sender<bool>,
    callbacks: CallbackManager<Message<M>>,
    write_back: WriteBack,
    closed: AtomicBool,
    max_update_spins: usize,
    observer: Option<Arc<dyn StoreObserver>>,
}

enum Change<D> {
    Local,
    Driver { data: D, version: u64 },
}

fn change_message<D, O>(change: CrdtChange<D, O>) -> Option<ProxyMessage<D, O>> {
    match change {
        CrdtChange::Operations(ops) if ops.is_empty() => None,
        CrdtChange::Operations(operations) => {
            Some(ProxyMessage::Operations { operations, id: None })
        }
        CrdtChange::Data(model) => Some(ProxyMessage::ModelUpdate { model, id: None }),
    }
}

impl<M: CrdtModel> DirectStore<M> {
    /// Open a store over `driver`, starting from `model`, and register for the
    /// driver's updates. Data the driver already holds is merged before this
    /// returns.
    pub async fn create(
        options: StoreOptions,
        driver: Arc<dyn Driver>,
        model: M,
        config: &StoreConfig,
        observer: Option<Arc<dyn StoreObserver>>,
    ) -> StoreResult<Self> {
        let write_back =
            WriteBack::for_protocol(&config.write_back, options.storage_key.protocol());
        let (settled, _) = watch::channel(true);
        let inner = Arc::new(Inner {
            storage_key: options.storage_key.clone(),
            driver,
            model: Mutex::new(model),
            machine: Mutex::new(Machine {
                state: StoreState::Idle,
                version: 0,
                pending: VecDeque::new(),
            }),
            driving: Arc::new(tokio::sync::Mutex::new(())),
            settled,
            callbacks: CallbackManager::new(),
            write_back,
            closed: AtomicBool::new(false),
            max_update_spins: config.max_update_spins,
            observer,
        });

        let weak: Weak<Inner<M>> = Arc::downgrade(&inner);
        let receiver = receiver_fn(move |data: Bytes, version: u64| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = Inner::on_receive(&inner, data, version).await {
                        error!(
                            storage_key = %inner.storage_key,
                            error = %e,
                            "failed to process driver update"
                        );
                    }
                }
            }
        });
        inner
            .driver
            .register_receiver(options.version_token.clone(), receiver)
            .await?;
        info!(
            storage_key = %inner.storage_key,
            queued = inner.write_back.is_queued(),
            "direct store opened"
        );
        Ok(Self { inner })
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.inner.storage_key
    }

    /// A copy of the local model's data.
    pub fn local_data(&self) -> M::Data {
        self.inner.model.lock().expect("model lock poisoned").data()
    }

    pub fn version_map(&self) -> VersionMap {
        self.inner.model.lock().expect("model lock poisoned").version_map()
    }

    /// The last version the driver acknowledged.
    pub fn version(&self) -> u64 {
        self.inner.machine.lock().expect("machine lock poisoned").version
    }

    pub fn state(&self) -> StoreState {
        self.inner.machine.lock().expect("machine lock poisoned").state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    pub async fn on(&self, callback: Arc<dyn Callback<Message<M>>>) -> StoreResult<CallbackId> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.storage_key.clone()));
        }
        Ok(self.inner.callbacks.register(callback))
    }

    /// Unregister a callback; removing the last one closes the store.
    pub async fn off(&self, id: CallbackId) {
        self.inner.callbacks.unregister(id);
        if self.inner.callbacks.is_empty() {
            self.close().await;
        }
    }

    pub async fn on_proxy_message(&self, message: Message<M>) -> StoreResult<bool> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(StoreError::Closed(inner.storage_key.clone()));
        }
        observer::notify(
            inner.observer.as_ref(),
            &ObservedMessage {
                boundary: Boundary::DirectStore,
                storage_key: &inner.storage_key,
                kind: message.kind(),
                sender: message.id(),
                mux_id: None,
                message: &message,
            },
        );

        match message {
            ProxyMessage::SyncRequest { id } => {
                let id = id.ok_or_else(|| StoreError::MissingSender(inner.storage_key.clone()))?;
                let model = self.local_data();
                inner
                    .callbacks
                    .send_to(id, ProxyMessage::ModelUpdate { model, id: Some(id) })
                    .await;
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                let applied = {
                    let mut model = inner.model.lock().expect("model lock poisoned");
                    operations.iter().all(|op| model.apply_operation(op))
                };
                if !applied {
                    debug!(
                        storage_key = %inner.storage_key,
                        sender = ?id,
                        "operations did not apply; requesting resync"
                    );
                    if let Some(id) = id {
                        inner
                            .callbacks
                            .send_to(id, ProxyMessage::SyncRequest { id: Some(id) })
                            .await;
                    }
                    return Ok(false);
                }
                if operations.is_empty() {
                    return Ok(true);
                }
                inner
                    .callbacks
                    .send(ProxyMessage::Operations { operations, id: None }, id)
                    .await;
                Inner::flush(inner).await?;
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let changes = inner.model.lock().expect("model lock poisoned").merge(model);
                let changed = !changes.model_change.is_empty();
                if let Some(message) = change_message(changes.model_change) {
                    inner.callbacks.send(message, id).await;
                }
                if changed {
                    Inner::flush(inner).await?;
                }
                Ok(true)
            }
        }
    }

    /// Wait until no flush is queued and the driver holds the local model.
    pub async fn idle(&self) {
        let inner = &self.inner;
        loop {
            inner.write_back.await_idle().await;
            let mut settled = inner.settled.subscribe();
            let _ = settled.wait_for(|s| *s).await;
            if inner.write_back.is_idle() {
                break;
            }
        }
    }

    /// Idempotent. Pending flushes run before the driver is closed.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.write_back.shutdown().await;
        // Let a running drive finish its send before the state goes terminal.
        let _guard = inner.driving.lock().await;
        {
            let mut machine = inner.machine.lock().expect("machine lock poisoned");
            machine.state = StoreState::Closed;
            machine.pending.clear();
            inner.settled.send_replace(true);
        }
        inner.callbacks.clear();
        if let Err(e) = inner.driver.close().await {
            warn!(storage_key = %inner.storage_key, error = %e, "driver close failed");
        }
        info!(storage_key = %inner.storage_key, "direct store closed");
    }
}

impl<M: CrdtModel> Inner<M> {
    /// Buffer a model pushed by the driver, and process it now unless another
    /// task is driving; that task drains the buffer before it lets go.
    async fn on_receive(self: &Arc<Self>, data: Bytes, version: u64) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let data: M::Data = decode_model(&data)?;
        let guard = {
            let mut machine = self.machine.lock().expect("machine lock poisoned");
            machine.pending.push_back((data, version));
            self.settled.send_replace(false);
            Arc::clone(&self.driving).try_lock_owned().ok()
        };
        match guard {
            Some(guard) => self.run(guard, None).await,
            None => {
                debug!(storage_key = %self.storage_key, version, "driver update buffered");
                Ok(())
            }
        }
    }

    /// Hand a local change to the write-back path.
    async fn flush(self: &Arc<Self>) -> StoreResult<()> {
        let this = Arc::clone(self);
        self.write_back
            .flush(Box::pin(async move {
                let guard = Arc::clone(&this.driving).lock_owned().await;
                this.run(guard, Some(Change::Local)).await
            }))
            .await
    }

    /// Process `first`, then every buffered driver model, holding `guard`.
    async fn run(
        self: &Arc<Self>,
        guard: OwnedMutexGuard<()>,
        first: Option<Change<M::Data>>,
    ) -> StoreResult<()> {
        self.settled.send_replace(false);
        let mut next = first;
        let mut result = Ok(());
        loop {
            if let Some(change) = next.take() {
                if let Err(e) = self.process(change).await {
                    error!(
                        storage_key = %self.storage_key,
                        error = %e,
                        "driver synchronization failed"
                    );
                    result = Err(e);
                }
            }
            let (data, version) = {
                let mut machine = self.machine.lock().expect("machine lock poisoned");
                match machine.pending.pop_front() {
                    Some(pending) => pending,
                    None => {
                        // Released under the machine lock so a concurrent
                        // on_receive either sees the guard free or is drained here.
                        let at_rest =
                            matches!(machine.state, StoreState::Idle | StoreState::Closed);
                        self.settled.send_replace(at_rest);
                        drop(guard);
                        return result;
                    }
                }
            };
            next = Some(Change::Driver { data, version });
        }
    }

    async fn process(self: &Arc<Self>, change: Change<M::Data>) -> StoreResult<()> {
        match change {
            Change::Local => self.drive(false).await,
            Change::Driver { data, version } => {
                let changes = self.model.lock().expect("model lock poisoned").merge(data);
                if let Some(message) = change_message(changes.model_change) {
                    self.callbacks.send(message, None).await;
                }
                let driver_is_current = changes.other_change.is_empty();
                {
                    let mut machine = self.machine.lock().expect("machine lock poisoned");
                    if machine.state == StoreState::Closed {
                        return Ok(());
                    }
                    machine.version = machine.version.max(version);
                    if driver_is_current {
                        machine.state = StoreState::Idle;
                    }
                }
                debug!(
                    storage_key = %self.storage_key,
                    version,
                    driver_is_current,
                    "merged driver model"
                );
                if driver_is_current {
                    Ok(())
                } else {
                    self.drive(true).await
                }
            }
        }
    }

    /// Step the state machine until it settles.
    async fn drive(&self, from_driver: bool) -> StoreResult<()> {
        let changed = Event::Changed { from_driver };
        let mut event = changed;
        for _ in 0..self.max_update_spins {
            let action = {
                let machine = self.machine.lock().expect("machine lock poisoned");
                state::next(machine.state, machine.version, event)
            };
            match action {
                Action::Enter { state, version } => {
                    self.set_state(state, version);
                    event = changed;
                }
                Action::Send { version } => {
                    let data = self.model.lock().expect("model lock poisoned").data();
                    let bytes = encode_model(&data)?;
                    let accepted = match self.driver.send(bytes, version).await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Back to the last acknowledged version so a later change retries.
                            self.set_state(StoreState::Idle, version.saturating_sub(1));
                            return Err(e.into());
                        }
                    };
                    debug!(
                        storage_key = %self.storage_key,
                        version,
                        accepted,
                        "driver send answered"
                    );
                    event = Event::Sent { accepted };
                }
                Action::Settle { state, version } => {
                    self.set_state(state, version);
                    return Ok(());
                }
                Action::Stop => return Ok(()),
            }
        }
        error!(
            storage_key = %self.storage_key,
            spins = self.max_update_spins,
            "driver state machine did not settle"
        );
        // Leave the machine where a later change or driver model can resume it.
        let (current, version) = {
            let machine = self.machine.lock().expect("machine lock poisoned");
            (machine.state, machine.version)
        };
        match state::next(current, version, event) {
            Action::Settle { state, version } => self.set_state(state, version),
            _ if current == StoreState::AwaitingResponse => {
                self.set_state(StoreState::Idle, version.saturating_sub(1));
            }
            _ => {}
        }
        Err(StoreError::SpinLimitExceeded {
            storage_key: self.storage_key.clone(),
            spins: self.max_update_spins,
        })
    }

    fn set_state(&self, state: StoreState, version: u64) {
        let mut machine = self.machine.lock().expect("machine lock poisoned");
        if machine.state != StoreState::Closed {
            machine.state = state;
            machine.version = version;
        }
    }
}

#[async_trait]
impl<M: CrdtModel> ActiveStore<M::Data, M::Op> for DirectStore<M> {
    fn storage_key(&self) -> StorageKey {
        self.inner.storage_key.clone()
    }

    async fn on(&self, callback: Arc<dyn Callback<Message<M>>>) -> StoreResult<CallbackId> {
        DirectStore::on(self, callback).await
    }

    async fn off(&self, id: CallbackId) {
        DirectStore::off(self, id).await
    }

    async fn on_proxy_message(&self, message: Message<M>) -> StoreResult<bool> {
        DirectStore::on_proxy_message(self, message).await
    }

    async fn idle(&self) {
        DirectStore::idle(self).await
    }

    async fn close(&self) {
        DirectStore::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_fn;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tandem_crdt::{CrdtCount, CrdtSet, FieldValue, SetData, SetOp};
    use tandem_driver::{DriverResult, DriverReceiver, VolatileDriver, VolatileMemory};
    use tandem_types::Actor;
    use tokio::sync::mpsc;

    type SetStore = DirectStore<CrdtSet<FieldValue>>;
    type SetMessage = ProxyMessage<SetData<FieldValue>, SetOp<FieldValue>>;

    fn key() -> StorageKey {
        StorageKey::new("volatile", "things")
    }

    async fn open(memory: &Arc<VolatileMemory>, config: &StoreConfig) -> SetStore {
        let driver = Arc::new(VolatileDriver::new(memory, &key()));
        DirectStore::create(StoreOptions::new(key()), driver, CrdtSet::new(), config, None)
            .await
            .unwrap()
    }

    fn recorder() -> (Arc<dyn Callback<SetMessage>>, mpsc::UnboundedReceiver<SetMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = callback_fn(move |message: SetMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });
        (callback, rx)
    }

    fn add(actor: &str, value: &str, model: &CrdtSet<FieldValue>) -> SetOp<FieldValue> {
        model.add_op(&Actor::from(actor), FieldValue::text(value))
    }

    fn stored(memory: &VolatileMemory) -> Option<(SetData<FieldValue>, u64)> {
        memory
            .get(&key())
            .map(|(bytes, version)| (decode_model(&bytes).unwrap(), version))
    }

    #[tokio::test]
    async fn operations_reach_driver_and_other_callbacks() {
        let memory = Arc::new(VolatileMemory::new());
        let store = open(&memory, &StoreConfig::default()).await;
        let (a, mut a_rx) = recorder();
        let (b, mut b_rx) = recorder();
        let a_id = store.on(a).await.unwrap();
        store.on(b).await.unwrap();

        let op = add("p1", "x", &CrdtSet::new());
        let accepted = store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![op.clone()],
                id: Some(a_id),
            })
            .await
            .unwrap();
        assert!(accepted);
        store.idle().await;

        assert_eq!(
            b_rx.try_recv().unwrap(),
            ProxyMessage::Operations {
                operations: vec![op],
                id: None
            }
        );
        assert!(a_rx.try_recv().is_err());
        let (data, version) = stored(&memory).unwrap();
        assert_eq!(version, 1);
        assert_eq!(data, store.local_data());
        assert_eq!(store.version(), 1);
        assert_eq!(store.state(), StoreState::Idle);
    }

    #[tokio::test]
    async fn failed_operation_asks_sender_to_resync() {
        let memory = Arc::new(VolatileMemory::new());
        let store = open(&memory, &StoreConfig::default()).await;
        let (a, mut a_rx) = recorder();
        let a_id = store.on(a).await.unwrap();

        let mut ahead = CrdtSet::new();
        assert!(ahead.apply_operation(&add("p1", "x", &ahead)));
        let skipped = add("p1", "y", &ahead);
        let accepted = store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![skipped],
                id: Some(a_id),
            })
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(a_rx.try_recv().unwrap(), ProxyMessage::SyncRequest { id: Some(a_id) });
        assert!(memory.get(&key()).is_none());
    }

    #[tokio::test]
    async fn sync_request_is_answered_with_model() {
        let memory = Arc::new(VolatileMemory::new());
        let store = open(&memory, &StoreConfig::default()).await;
        let (a, mut a_rx) = recorder();
        let a_id = store.on(a).await.unwrap();
        store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap();
        let _ = a_rx.try_recv();

        store
            .on_proxy_message(ProxyMessage::SyncRequest { id: Some(a_id) })
            .await
            .unwrap();
        assert_eq!(
            a_rx.try_recv().unwrap(),
            ProxyMessage::ModelUpdate {
                model: store.local_data(),
                id: Some(a_id)
            }
        );
        assert!(matches!(
            store.on_proxy_message(ProxyMessage::SyncRequest { id: None }).await,
            Err(StoreError::MissingSender(_))
        ));
    }

    #[tokio::test]
    async fn model_update_already_known_is_not_resent() {
        let memory = Arc::new(VolatileMemory::new());
        let store = open(&memory, &StoreConfig::default()).await;
        let (a, mut a_rx) = recorder();
        let (b, _b_rx) = recorder();
        store.on(a).await.unwrap();
        let b_id = store.on(b).await.unwrap();
        store
            .on_proxy_message(ProxyMessage::ModelUpdate {
                model: SetData::default(),
                id: Some(b_id),
            })
            .await
            .unwrap();
        store.idle().await;
        assert!(a_rx.try_recv().is_err());
        assert!(memory.get(&key()).is_none());
    }

    #[tokio::test]
    async fn stores_sharing_a_key_converge() {
        let memory = Arc::new(VolatileMemory::new());
        let config = StoreConfig::default();
        let first = open(&memory, &config).await;
        let second = open(&memory, &config).await;
        let (watcher, mut watcher_rx) = recorder();
        second.on(watcher).await.unwrap();
        let (keeper, _keeper_rx) = recorder();
        first.on(keeper).await.unwrap();

        first
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap();
        second
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p2", "y", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap();
        first.idle().await;
        second.idle().await;

        assert_eq!(first.local_data(), second.local_data());
        assert_eq!(first.local_data().values.len(), 2);
        let (data, _) = stored(&memory).unwrap();
        assert_eq!(data, first.local_data());
        assert!(matches!(
            watcher_rx.try_recv().unwrap(),
            ProxyMessage::ModelUpdate { id: None, .. }
        ));
    }

    #[tokio::test]
    async fn initial_driver_data_is_loaded() {
        let memory = Arc::new(VolatileMemory::new());
        let config = StoreConfig::default();
        let writer = open(&memory, &config).await;
        let (keeper, _rx) = recorder();
        writer.on(keeper).await.unwrap();
        writer
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap();
        writer.idle().await;

        let reader = open(&memory, &config).await;
        assert_eq!(reader.local_data(), writer.local_data());
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.state(), StoreState::Idle);
    }

    /// Rejects the first send after a rival write, then pushes that write.
    struct RacingDriver {
        inner: VolatileDriver,
        memory: Arc<VolatileMemory>,
        raced: AtomicBool,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl Driver for RacingDriver {
        fn storage_key(&self) -> &StorageKey {
            self.inner.storage_key()
        }

        fn token(&self) -> Option<String> {
            self.inner.token()
        }

        async fn register_receiver(
            &self,
            token: Option<String>,
            receiver: DriverReceiver,
        ) -> DriverResult<()> {
            self.inner.register_receiver(token, receiver).await
        }

        async fn send(&self, data: Bytes, version: u64) -> DriverResult<bool> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if !self.raced.swap(true, Ordering::SeqCst) {
                let rival = VolatileDriver::new(&self.memory, &key());
                let mut set = CrdtSet::new();
                assert!(set.apply_operation(&add("rival", "r", &set)));
                assert!(rival.send(encode_model(&set.data()).unwrap(), version).await?);
            }
            self.inner.send(data, version).await
        }

        async fn clone_driver(&self) -> DriverResult<Arc<dyn Driver>> {
            self.inner.clone_driver().await
        }

        async fn close(&self) -> DriverResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn rejected_send_recovers_from_driver_model() {
        let memory = Arc::new(VolatileMemory::new());
        let driver = Arc::new(RacingDriver {
            inner: VolatileDriver::new(&memory, &key()),
            memory: Arc::clone(&memory),
            raced: AtomicBool::new(false),
            sends: AtomicUsize::new(0),
        });
        let store: SetStore = DirectStore::create(
            StoreOptions::new(key()),
            driver.clone(),
            CrdtSet::new(),
            &StoreConfig::default(),
            None,
        )
        .await
        .unwrap();
        let (keeper, _rx) = recorder();
        store.on(keeper).await.unwrap();

        store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap();
        store.idle().await;

        assert_eq!(driver.sends.load(Ordering::SeqCst), 2);
        let (data, version) = stored(&memory).unwrap();
        assert_eq!(version, 2);
        assert_eq!(data.values.len(), 2);
        assert_eq!(data, store.local_data());
        assert_eq!(store.state(), StoreState::Idle);
    }

    /// Rejects every send while `reject` is set.
    struct GatedDriver {
        inner: VolatileDriver,
        reject: AtomicBool,
    }

    impl GatedDriver {
        fn new(memory: &Arc<VolatileMemory>) -> Arc<Self> {
            Arc::new(Self {
                inner: VolatileDriver::new(memory, &key()),
                reject: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Driver for GatedDriver {
        fn storage_key(&self) -> &StorageKey {
            self.inner.storage_key()
        }

        fn token(&self) -> Option<String> {
            self.inner.token()
        }

        async fn register_receiver(
            &self,
            token: Option<String>,
            receiver: DriverReceiver,
        ) -> DriverResult<()> {
            self.inner.register_receiver(token, receiver).await
        }

        async fn send(&self, data: Bytes, version: u64) -> DriverResult<bool> {
            if self.reject.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.send(data, version).await
        }

        async fn clone_driver(&self) -> DriverResult<Arc<dyn Driver>> {
            self.inner.clone_driver().await
        }

        async fn close(&self) -> DriverResult<()> {
            self.inner.close().await
        }
    }

    /// Write a model holding one value from another driver, as a rival store would.
    async fn rival_write(memory: &Arc<VolatileMemory>, version: u64) {
        let rival = VolatileDriver::new(memory, &key());
        let mut set = CrdtSet::new();
        assert!(set.apply_operation(&add("rival", "r", &set)));
        assert!(rival.send(encode_model(&set.data()).unwrap(), version).await.unwrap());
    }

    async fn open_gated(
        memory: &Arc<VolatileMemory>,
        config: &StoreConfig,
    ) -> (SetStore, Arc<GatedDriver>) {
        let driver = GatedDriver::new(memory);
        let options = StoreOptions::new(key());
        let store = DirectStore::create(options, driver.clone(), CrdtSet::new(), config, None)
            .await
            .unwrap();
        let (keeper, _rx) = recorder();
        store.on(keeper).await.unwrap();
        (store, driver)
    }

    #[tokio::test]
    async fn idle_waits_out_a_rejected_send() {
        let memory = Arc::new(VolatileMemory::new());
        let (store, driver) = open_gated(&memory, &StoreConfig::default()).await;
        assert!(store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await
            .unwrap());
        assert_eq!(store.state(), StoreState::AwaitingDriverModel);
        assert!(tokio::time::timeout(Duration::from_millis(100), store.idle())
            .await
            .is_err());

        driver.reject.store(false, Ordering::SeqCst);
        rival_write(&memory, 1).await;
        tokio::time::timeout(Duration::from_secs(5), store.idle())
            .await
            .unwrap();
        assert_eq!(store.state(), StoreState::Idle);
        let (data, version) = stored(&memory).unwrap();
        assert_eq!(version, 2);
        assert_eq!(data.values.len(), 2);
    }

    #[tokio::test]
    async fn spin_limit_is_reported_and_store_stays_usable() {
        let memory = Arc::new(VolatileMemory::new());
        let config = StoreConfig {
            max_update_spins: 2,
            ..StoreConfig::default()
        };
        let (store, driver) = open_gated(&memory, &config).await;
        let result = store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![add("p1", "x", &CrdtSet::new())],
                id: None,
            })
            .await;
        assert!(matches!(result, Err(StoreError::SpinLimitExceeded { spins: 2, .. })));
        assert_eq!(store.state(), StoreState::AwaitingDriverModel);

        // The driver's model restarts the machine; the merged model lands.
        driver.reject.store(false, Ordering::SeqCst);
        rival_write(&memory, 1).await;
        tokio::time::timeout(Duration::from_secs(5), store.idle())
            .await
            .unwrap();
        assert_eq!(store.state(), StoreState::Idle);
        assert_eq!(stored(&memory).unwrap().1, 2);

        let later = add("p1", "y", &CrdtSet::from_data(store.local_data()));
        let _ = store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![later],
                id: None,
            })
            .await;
        store.idle().await;
        let (data, version) = stored(&memory).unwrap();
        assert_eq!(version, 3);
        assert_eq!(data.values.len(), 3);
        assert_eq!(data, store.local_data());
        assert_eq!(store.state(), StoreState::Idle);
    }

    #[tokio::test]
    async fn queued_write_back_flushes_in_background() {
        let memory = Arc::new(VolatileMemory::new());
        let config = StoreConfig::default();
        let db_key = StorageKey::new("db", "things");
        let driver = Arc::new(VolatileDriver::new(&memory, &db_key));
        let store: DirectStore<CrdtCount> = DirectStore::create(
            StoreOptions::new(db_key.clone()),
            driver,
            CrdtCount::new(),
            &config,
            None,
        )
        .await
        .unwrap();
        let mut count = CrdtCount::new();
        let mut operations = Vec::new();
        for _ in 0..3 {
            let op = count.increment_op(&Actor::from("p1"));
            assert!(count.apply_operation(&op));
            operations.push(op);
        }
        store
            .on_proxy_message(ProxyMessage::Operations { operations, id: None })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), store.idle())
            .await
            .unwrap();
        let (bytes, _) = memory.get(&db_key).unwrap();
        let data: tandem_crdt::CountData = decode_model(&bytes).unwrap();
        assert_eq!(CrdtCount::from_data(data).consumer_view(), 3);
    }

    #[tokio::test]
    async fn removing_last_callback_closes_store() {
        let memory = Arc::new(VolatileMemory::new());
        let store = open(&memory, &StoreConfig::default()).await;
        let (a, _rx) = recorder();
        let id = store.on(a).await.unwrap();
        store.off(id).await;
        assert!(store.is_closed());
        assert_eq!(store.state(), StoreState::Closed);
        assert!(matches!(
            store.on_proxy_message(ProxyMessage::SyncRequest { id: Some(id) }).await,
            Err(StoreError::Closed(_))
        ));
        store.close().await;
    }
}
