use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tandem_crdt::{
    ContainerKind, ContainerOp, ContainerValue, CrdtContainer, CrdtEntity, CrdtSet, CrdtSingleton,
    EntityData, EntityOp, FieldValue, RawEntity, Reference, SetData, SetOp, SingletonOp,
};
use tandem_driver::{DriverFactory, VolatileDriverProvider, VolatileMemory};
use tandem_proxy::{HandleId, ProxyOptions, ProxyState, StorageProxy};
use tandem_store::{
    ActiveStore, Callback, CallbackId, EntityStore, MessageKind, ProxyMessage, ReferenceModeStore,
    StoreConfig, StoreFactory, StoreOptions, StoreResult,
};
use tandem_types::{Actor, ReferenceModeStorageKey, StorageKey, VersionMap};
use tracing::{debug, info};

use crate::cli::Scenario;

const WAIT: Duration = Duration::from_secs(5);

/// Outcome of one scenario run.
#[derive(Debug, Serialize)]
pub struct Report {
    pub scenario: &'static str,
    pub passed: bool,
    pub checks: Vec<Check>,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Report {
    fn new(scenario: Scenario) -> Self {
        Self {
            scenario: scenario.name(),
            passed: true,
            checks: Vec::new(),
        }
    }

    fn check(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        self.passed &= passed;
        self.checks.push(Check {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        });
    }
}

/// A store factory over a fresh in-memory driver.
pub fn volatile_factory(config: StoreConfig) -> StoreFactory {
    let memory = Arc::new(VolatileMemory::new());
    let drivers = DriverFactory::new().with_provider(Arc::new(VolatileDriverProvider::new(memory)));
    StoreFactory::new(drivers, config)
}

pub async fn run(scenario: Scenario, factory: &StoreFactory) -> anyhow::Result<Report> {
    info!(scenario = scenario.name(), "running scenario");
    let report = match scenario {
        Scenario::Roundtrip => roundtrip(factory).await?,
        Scenario::ConcurrentAdd => concurrent_add(factory).await?,
        Scenario::BackingRace => backing_race(factory).await?,
        Scenario::ForcedDesync => forced_desync(factory).await?,
    };
    debug!(scenario = scenario.name(), passed = report.passed, "scenario finished");
    Ok(report)
}

async fn roundtrip(factory: &StoreFactory) -> anyhow::Result<Report> {
    let mut report = Report::new(Scenario::Roundtrip);
    let key = StorageKey::new("volatile", "roundtrip");
    let store = factory
        .direct_store(StoreOptions::new(key), CrdtSingleton::<RawEntity>::new())
        .await?;
    let store: Arc<dyn ActiveStore<SetData<RawEntity>, SingletonOp<RawEntity>>> = Arc::new(store);

    let a = StorageProxy::new(
        Arc::clone(&store),
        CrdtSingleton::<RawEntity>::new(),
        ProxyOptions::default(),
    )
    .await?;
    let value = RawEntity::new("v").with_singleton("x", Some(FieldValue::Int(1)));
    let op = CrdtSingleton::<RawEntity>::new().update_op(&Actor::from("A"), value);
    let accepted = a.apply_op(op)?.accepted().await?;
    report.check("writer's update accepted", accepted, format!("accepted = {accepted}"));

    let b = StorageProxy::new(
        Arc::clone(&store),
        CrdtSingleton::<RawEntity>::new(),
        ProxyOptions::default(),
    )
    .await?;
    b.prepare_for_sync()?;
    let read = tokio::time::timeout(WAIT, b.value()).await.context("reader never synced")??;
    let x = read.as_ref().and_then(|entity| entity.singleton("x")).cloned();
    report.check("reader sees x = 1", x == Some(FieldValue::Int(1)), format!("{x:?}"));
    let version = b.version_map();
    let expected: VersionMap = [("A", 1)].into_iter().collect();
    report.check("reader is at the writer's version", version == expected, format!("{version:?}"));

    a.close().await;
    b.close().await;
    store.close().await;
    Ok(report)
}

async fn concurrent_add(factory: &StoreFactory) -> anyhow::Result<Report> {
    let mut report = Report::new(Scenario::ConcurrentAdd);
    let key = ReferenceModeStorageKey::new(
        StorageKey::new("volatile", "people-backing"),
        StorageKey::new("volatile", "people-container"),
    );
    let store = factory.open_store(key.to_storage_key(), ContainerKind::Collection).await?;

    let a = entity_proxy(&store).await?;
    let b = entity_proxy(&store).await?;
    let blank = CrdtContainer::<RawEntity>::collection();
    let e1 = RawEntity::new("e1").with_singleton("name", Some(FieldValue::text("ada")));
    let e2 = RawEntity::new("e2").with_singleton("name", Some(FieldValue::text("grace")));
    let a_ok = a.apply_op(blank.put_op(&Actor::from("A"), e1))?.accepted().await?;
    let b_ok = b.apply_op(blank.put_op(&Actor::from("B"), e2))?.accepted().await?;
    report.check("both adds accepted", a_ok && b_ok, format!("A = {a_ok}, B = {b_ok}"));

    let mut views = Vec::new();
    for proxy in [&a, &b] {
        proxy.prepare_for_sync()?;
        let value = tokio::time::timeout(WAIT, proxy.value()).await.context("proxy never synced")??;
        views.push(entity_ids(&value));
    }
    let both: BTreeSet<String> = ["e1", "e2"].into_iter().map(String::from).collect();
    report.check("A holds e1 and e2", views[0] == both, format!("{:?}", views[0]));
    report.check("B holds e1 and e2", views[1] == both, format!("{:?}", views[1]));
    report.check(
        "proxies converge",
        views[0] == views[1],
        format!("{:?} / {:?}", views[0], views[1]),
    );

    a.close().await;
    b.close().await;
    store.close().await;
    Ok(report)
}

async fn backing_race(factory: &StoreFactory) -> anyhow::Result<Report> {
    let mut report = Report::new(Scenario::BackingRace);
    let key = ReferenceModeStorageKey::new(
        StorageKey::new("volatile", "race-backing"),
        StorageKey::new("volatile", "race-container"),
    );
    let store = Arc::new(
        ReferenceModeStore::create(
            StoreOptions::new(key.to_storage_key()),
            ContainerKind::Collection,
            factory.drivers(),
            factory.config(),
            None,
        )
        .await?,
    );
    let shared: EntityStore = store.clone();
    let proxy = entity_proxy(&shared).await?;
    proxy.prepare_for_sync()?;
    let _ = tokio::time::timeout(WAIT, proxy.value()).await.context("proxy never synced")??;

    // Second writers on the container and on the entity's backing key.
    let container = factory
        .direct_store(
            StoreOptions::new(key.container.clone()),
            CrdtContainer::<Reference>::collection(),
        )
        .await?;
    let entity = factory
        .direct_store(StoreOptions::new(key.backing.child("e3")), CrdtEntity::new())
        .await?;
    let writer = Actor::from("k");

    let reference = Reference::new("e3", key.backing.clone(), Some(clock(&writer, 2)));
    container
        .on_proxy_message(ProxyMessage::Operations {
            operations: vec![ContainerOp::Collection(SetOp::Add {
                actor: writer.clone(),
                clock: clock(&writer, 1),
                added: reference,
            })],
            id: None,
        })
        .await?;
    proxy.idle().await;
    let seen = entity_ids(&proxy.value_now()?);
    report.check(
        "reference ahead of backing is held",
        store.held_sends() == 1 && seen.is_empty(),
        format!("held = {}, proxy sees {seen:?}", store.held_sends()),
    );

    write_name(&entity, &writer, 1, "stale").await?;
    proxy.idle().await;
    let seen = entity_ids(&proxy.value_now()?);
    report.check(
        "older backing version does not release the hold",
        store.held_sends() == 1 && seen.is_empty(),
        format!("held = {}, proxy sees {seen:?}", store.held_sends()),
    );

    write_name(&entity, &writer, 2, "fresh").await?;
    proxy.idle().await;
    let name = entity_name(&proxy.value_now()?, "e3");
    report.check(
        "matching backing version releases the fresh entity",
        store.held_sends() == 0 && name == Some(FieldValue::text("fresh")),
        format!("held = {}, name = {name:?}", store.held_sends()),
    );

    proxy.close().await;
    container.close().await;
    entity.close().await;
    store.close().await;
    Ok(report)
}

async fn forced_desync(factory: &StoreFactory) -> anyhow::Result<Report> {
    let mut report = Report::new(Scenario::ForcedDesync);
    let key = StorageKey::new("volatile", "desync");
    let store = factory
        .direct_store(StoreOptions::new(key), CrdtSet::<FieldValue>::new())
        .await?;
    let store: Arc<dyn ActiveStore<SetData<FieldValue>, SetOp<FieldValue>>> = Arc::new(store);
    let tap = Arc::new(Tap::new(Arc::clone(&store)));

    let writer = StorageProxy::new(
        Arc::clone(&store),
        CrdtSet::<FieldValue>::new(),
        ProxyOptions::write_only(),
    )
    .await?;
    let added = CrdtSet::<FieldValue>::new().add_op(&Actor::from("W"), FieldValue::text("a"));
    writer.apply_op(added)?.accepted().await?;

    let reader = StorageProxy::new(
        tap.clone(),
        CrdtSet::<FieldValue>::new(),
        ProxyOptions::default(),
    )
    .await?;
    reader.prepare_for_sync()?;
    tokio::time::timeout(WAIT, reader.value()).await.context("reader never synced")??;
    let (desyncs, on_desync) = counter();
    let (resyncs, on_resync) = counter();
    let handle = HandleId::new("scenario");
    reader.add_on_desync(handle.clone(), on_desync)?;
    reader.add_on_resync(handle, on_resync)?;
    let requests_before = tap.sync_requests();

    let impossible = SetOp::Remove {
        actor: Actor::from("ghost"),
        clock: clock(&Actor::from("ghost"), 3),
        removed: FieldValue::text("never-added"),
    };
    tap.inject(ProxyMessage::Operations {
        operations: vec![impossible],
        id: None,
    })
    .await?;
    reader.idle().await;

    let desyncs = desyncs.load(Ordering::SeqCst);
    report.check(
        "proxy reports the desync",
        desyncs == 1,
        format!("on_desync fired {desyncs} time(s)"),
    );
    let new_requests = tap.sync_requests() - requests_before;
    report.check(
        "store sees a fresh sync request",
        new_requests == 1,
        format!("{new_requests} new sync request(s)"),
    );
    let resyncs = resyncs.load(Ordering::SeqCst);
    report.check(
        "proxy resyncs exactly once",
        resyncs == 1 && reader.state() == ProxyState::Sync,
        format!("on_resync fired {resyncs} time(s), state = {}", reader.state()),
    );
    let value = reader.value_now()?;
    let expected: BTreeSet<FieldValue> = [FieldValue::text("a")].into_iter().collect();
    report.check("value survives the resync", value == expected, format!("{value:?}"));

    writer.close().await;
    reader.close().await;
    store.close().await;
    Ok(report)
}

async fn entity_proxy(
    store: &EntityStore,
) -> anyhow::Result<StorageProxy<CrdtContainer<RawEntity>>> {
    Ok(StorageProxy::new(
        Arc::clone(store),
        CrdtContainer::<RawEntity>::collection(),
        ProxyOptions::default(),
    )
    .await?)
}

async fn write_name<S>(entity: &S, actor: &Actor, version: u64, name: &str) -> StoreResult<bool>
where
    S: ActiveStore<EntityData, EntityOp>,
{
    entity
        .on_proxy_message(ProxyMessage::Operations {
            operations: vec![EntityOp::SetSingleton {
                actor: actor.clone(),
                clock: clock(actor, version),
                field: "name".into(),
                value: FieldValue::text(name),
            }],
            id: None,
        })
        .await
}

fn clock(actor: &Actor, version: u64) -> VersionMap {
    [(actor.as_str(), version)].into_iter().collect()
}

fn entities(value: &ContainerValue<RawEntity>) -> Vec<&RawEntity> {
    match value {
        ContainerValue::Collection(set) => set.iter().collect(),
        ContainerValue::Singleton(entity) => entity.iter().collect(),
    }
}

fn entity_ids(value: &ContainerValue<RawEntity>) -> BTreeSet<String> {
    entities(value).into_iter().map(|e| e.id.clone()).collect()
}

fn entity_name(value: &ContainerValue<RawEntity>, id: &str) -> Option<FieldValue> {
    entities(value)
        .into_iter()
        .find(|e| e.id == id)
        .and_then(|e| e.singleton("name").cloned())
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

type SetMessage = ProxyMessage<SetData<FieldValue>, SetOp<FieldValue>>;

/// Sits between a proxy and its store, counting sync requests and letting
/// the scenario push messages straight to the proxy.
struct Tap {
    inner: Arc<dyn ActiveStore<SetData<FieldValue>, SetOp<FieldValue>>>,
    callback: Mutex<Option<Arc<dyn Callback<SetMessage>>>>,
    sync_requests: AtomicUsize,
}

impl Tap {
    fn new(inner: Arc<dyn ActiveStore<SetData<FieldValue>, SetOp<FieldValue>>>) -> Self {
        Self {
            inner,
            callback: Mutex::new(None),
            sync_requests: AtomicUsize::new(0),
        }
    }

    fn sync_requests(&self) -> usize {
        self.sync_requests.load(Ordering::SeqCst)
    }

    async fn inject(&self, message: SetMessage) -> anyhow::Result<()> {
        let callback = self
            .callback
            .lock()
            .expect("tap lock poisoned")
            .clone()
            .context("no proxy attached")?;
        callback.deliver(message).await;
        Ok(())
    }
}

#[async_trait]
impl ActiveStore<SetData<FieldValue>, SetOp<FieldValue>> for Tap {
    fn storage_key(&self) -> StorageKey {
        self.inner.storage_key()
    }

    async fn on(&self, callback: Arc<dyn Callback<SetMessage>>) -> StoreResult<CallbackId> {
        *self.callback.lock().expect("tap lock poisoned") = Some(Arc::clone(&callback));
        self.inner.on(callback).await
    }

    async fn off(&self, id: CallbackId) {
        self.inner.off(id).await
    }

    async fn on_proxy_message(&self, message: SetMessage) -> StoreResult<bool> {
        if message.kind() == MessageKind::SyncRequest {
            self.sync_requests.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.on_proxy_message(message).await
    }

    async fn idle(&self) {
        self.inner.idle().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
