use std::sync::Arc;

use tandem_crdt::{ContainerKind, CrdtContainer, CrdtModel};
use tandem_driver::DriverFactory;
use tandem_types::StorageKey;
use tracing::debug;

use crate::config::StoreConfig;
use crate::direct::DirectStore;
use crate::error::StoreResult;
use crate::observer::StoreObserver;
use crate::reference_mode::{RefModeData, RefModeOp, ReferenceModeStore};
use crate::store::{ActiveStore, StoreOptions};

/// Entity store of either flavour, as seen by a proxy.
pub type EntityStore = Arc<dyn ActiveStore<RefModeData, RefModeOp>>;

/// Opens stores against a shared driver factory and configuration.
#[derive(Clone)]
pub struct StoreFactory {
    drivers: DriverFactory,
    config: StoreConfig,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl StoreFactory {
    pub fn new(drivers: DriverFactory, config: StoreConfig) -> Self {
        Self {
            drivers,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn drivers(&self) -> &DriverFactory {
        &self.drivers
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open a direct store for `model` on the driver serving the key.
    pub async fn direct_store<M: CrdtModel>(
        &self,
        options: StoreOptions,
        model: M,
    ) -> StoreResult<DirectStore<M>> {
        let driver = self.drivers.get_driver(&options.storage_key).await?;
        DirectStore::create(options, driver, model, &self.config, self.observer.clone()).await
    }

    /// Open a store of entities: reference-mode when the key names a backing
    /// and a container, otherwise a direct store holding whole entities.
    pub async fn open_entity_store(
        &self,
        options: StoreOptions,
        kind: ContainerKind,
    ) -> StoreResult<EntityStore> {
        if options.storage_key.is_reference_mode() {
            debug!(storage_key = %options.storage_key, "opening reference-mode store");
            let store = ReferenceModeStore::create(
                options,
                kind,
                &self.drivers,
                &self.config,
                self.observer.clone(),
            )
            .await?;
            return Ok(Arc::new(store));
        }
        let store = self.direct_store(options, CrdtContainer::new(kind)).await?;
        Ok(Arc::new(store))
    }

    pub async fn open_store(
        &self,
        storage_key: StorageKey,
        kind: ContainerKind,
    ) -> StoreResult<EntityStore> {
        self.open_entity_store(StoreOptions::new(storage_key), kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_fn;
    use crate::message::ProxyMessage;
    use tandem_crdt::{CrdtCount, FieldValue, RawEntity};
    use tandem_driver::{VolatileDriverProvider, VolatileMemory};
    use tandem_types::{Actor, ReferenceModeStorageKey};

    fn factory(memory: &Arc<VolatileMemory>) -> StoreFactory {
        let provider = VolatileDriverProvider::new(Arc::clone(memory));
        let drivers = DriverFactory::new().with_provider(Arc::new(provider));
        StoreFactory::new(drivers, StoreConfig::default())
    }

    async fn add_one(store: &EntityStore) {
        let id = store
            .on(callback_fn(|_: ProxyMessage<RefModeData, RefModeOp>| async {}))
            .await
            .unwrap();
        let proxy = CrdtContainer::<RawEntity>::collection();
        let entity = RawEntity::new("e1").with_singleton("name", Some(FieldValue::text("ada")));
        let accepted = store
            .on_proxy_message(ProxyMessage::Operations {
                operations: vec![proxy.put_op(&Actor::from("w"), entity)],
                id: Some(id),
            })
            .await
            .unwrap();
        assert!(accepted);
        store.idle().await;
    }

    #[tokio::test]
    async fn plain_key_opens_direct_entity_store() {
        let memory = Arc::new(VolatileMemory::new());
        let key = StorageKey::new("volatile", "people");
        let store = factory(&memory)
            .open_store(key.clone(), ContainerKind::Collection)
            .await
            .unwrap();
        add_one(&store).await;
        assert_eq!(memory.keys(), vec![key]);
    }

    #[tokio::test]
    async fn reference_mode_key_splits_storage() {
        let memory = Arc::new(VolatileMemory::new());
        let key = ReferenceModeStorageKey::new(
            StorageKey::new("volatile", "backing"),
            StorageKey::new("volatile", "container"),
        );
        let store = factory(&memory)
            .open_store(key.to_storage_key(), ContainerKind::Collection)
            .await
            .unwrap();
        add_one(&store).await;
        assert!(memory.contains(&key.container));
        assert!(memory.contains(&key.backing.child("e1")));
        store.close().await;
    }

    #[tokio::test]
    async fn unknown_protocol_fails_to_open() {
        let memory = Arc::new(VolatileMemory::new());
        let result = factory(&memory)
            .direct_store(StoreOptions::new(StorageKey::new("cloud", "x")), CrdtCount::new())
            .await;
        assert!(result.is_err());
    }
}
