use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_types::StorageKey;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DriverError, DriverResult};
use crate::traits::{Driver, DriverProvider, DriverReceiver};

#[derive(Default)]
struct Entry {
    data: Option<Bytes>,
    version: u64,
    token: Option<String>,
    receivers: Vec<(u64, DriverReceiver)>,
}

/// In-process storage shared by every [`VolatileDriver`] opened on it.
///
/// Plays the role of a durable backend in tests and simulations: each key
/// holds the latest bytes, their version and a token, and fans changes out to
/// the receivers of every other connection.
#[derive(Default)]
pub struct VolatileMemory {
    entries: Mutex<HashMap<StorageKey, Entry>>,
    next_connection: AtomicU64,
}

impl VolatileMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes and version stored under `key`.
    pub fn get(&self, key: &StorageKey) -> Option<(Bytes, u64)> {
        let entries = self.entries.lock().expect("volatile memory lock poisoned");
        let entry = entries.get(key)?;
        entry.data.clone().map(|data| (data, entry.version))
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.get(key).is_some()
    }

    /// Every key that holds data, sorted.
    pub fn keys(&self) -> Vec<StorageKey> {
        let entries = self.entries.lock().expect("volatile memory lock poisoned");
        let keys: BTreeSet<StorageKey> = entries
            .iter()
            .filter(|(_, entry)| entry.data.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter().collect()
    }

    fn open(self: &Arc<Self>, key: &StorageKey) -> VolatileDriver {
        VolatileDriver {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            storage_key: key.clone(),
            memory: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }
}

/// A connection to one key in a [`VolatileMemory`].
pub struct VolatileDriver {
    id: u64,
    storage_key: StorageKey,
    memory: Arc<VolatileMemory>,
    closed: AtomicBool,
}

impl VolatileDriver {
    pub fn new(memory: &Arc<VolatileMemory>, key: &StorageKey) -> Self {
        memory.open(key)
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed(self.storage_key.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for VolatileDriver {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    fn token(&self) -> Option<String> {
        let entries = self.memory.entries.lock().expect("volatile memory lock poisoned");
        entries.get(&self.storage_key).and_then(|e| e.token.clone())
    }

    async fn register_receiver(
        &self,
        token: Option<String>,
        receiver: DriverReceiver,
    ) -> DriverResult<()> {
        self.check_open()?;
        let initial = {
            let mut entries = self.memory.entries.lock().expect("volatile memory lock poisoned");
            let entry = entries.entry(self.storage_key.clone()).or_default();
            if entry.receivers.iter().any(|(id, _)| *id == self.id) {
                return Err(DriverError::ReceiverAlreadyRegistered(self.storage_key.clone()));
            }
            entry.receivers.push((self.id, Arc::clone(&receiver)));
            match &entry.data {
                Some(data) if entry.token != token => Some((data.clone(), entry.version)),
                _ => None,
            }
        };
        if let Some((data, version)) = initial {
            debug!(storage_key = %self.storage_key, version, "delivering initial data to receiver");
            receiver(data, version).await;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes, version: u64) -> DriverResult<bool> {
        self.check_open()?;
        let targets = {
            let mut entries = self.memory.entries.lock().expect("volatile memory lock poisoned");
            let entry = entries.entry(self.storage_key.clone()).or_default();
            if version != entry.version + 1 {
                debug!(
                    storage_key = %self.storage_key,
                    version,
                    stored = entry.version,
                    "rejecting out-of-sequence write"
                );
                return Ok(false);
            }
            entry.data = Some(data.clone());
            entry.version = version;
            entry.token = Some(Uuid::now_v7().to_string());
            entry
                .receivers
                .iter()
                .filter(|(id, _)| *id != self.id)
                .map(|(_, r)| Arc::clone(r))
                .collect::<Vec<_>>()
        };
        for receiver in targets {
            receiver(data.clone(), version).await;
        }
        Ok(true)
    }

    async fn clone_driver(&self) -> DriverResult<Arc<dyn Driver>> {
        self.check_open()?;
        Ok(Arc::new(self.memory.open(&self.storage_key)))
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut entries = self.memory.entries.lock().expect("volatile memory lock poisoned");
        if let Some(entry) = entries.get_mut(&self.storage_key) {
            entry.receivers.retain(|(id, _)| *id != self.id);
        }
        Ok(())
    }
}

/// Serves volatile drivers for a configurable set of protocols.
pub struct VolatileDriverProvider {
    memory: Arc<VolatileMemory>,
    protocols: Vec<String>,
}

impl VolatileDriverProvider {
    /// Protocols served when none are given.
    pub const DEFAULT_PROTOCOLS: [&'static str; 3] = ["volatile", "ramdisk", "db"];

    pub fn new(memory: Arc<VolatileMemory>) -> Self {
        Self::with_protocols(memory, Self::DEFAULT_PROTOCOLS)
    }

    pub fn with_protocols<I, S>(memory: Arc<VolatileMemory>, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            memory,
            protocols: protocols.into_iter().map(Into::into).collect(),
        }
    }

    pub fn memory(&self) -> &Arc<VolatileMemory> {
        &self.memory
    }
}

#[async_trait]
impl DriverProvider for VolatileDriverProvider {
    fn will_support(&self, key: &StorageKey) -> bool {
        self.protocols.iter().any(|p| p == key.protocol())
    }

    async fn driver(&self, key: &StorageKey) -> DriverResult<Arc<dyn Driver>> {
        Ok(Arc::new(VolatileDriver::new(&self.memory, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::receiver_fn;
    use tokio::sync::mpsc;

    fn key() -> StorageKey {
        StorageKey::new("volatile", "things")
    }

    fn recording_receiver() -> (DriverReceiver, mpsc::UnboundedReceiver<(Bytes, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = receiver_fn(move |data, version| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((data, version));
            }
        });
        (receiver, rx)
    }

    #[tokio::test]
    async fn send_requires_successor_version() {
        let memory = Arc::new(VolatileMemory::new());
        let driver = VolatileDriver::new(&memory, &key());
        assert!(driver.send(Bytes::from_static(b"a"), 1).await.unwrap());
        assert!(!driver.send(Bytes::from_static(b"b"), 1).await.unwrap());
        assert!(!driver.send(Bytes::from_static(b"b"), 3).await.unwrap());
        assert!(driver.send(Bytes::from_static(b"b"), 2).await.unwrap());
        assert_eq!(memory.get(&key()), Some((Bytes::from_static(b"b"), 2)));
    }

    #[tokio::test]
    async fn other_connections_are_notified() {
        let memory = Arc::new(VolatileMemory::new());
        let writer = VolatileDriver::new(&memory, &key());
        let reader = VolatileDriver::new(&memory, &key());
        let (own, mut own_rx) = recording_receiver();
        let (other, mut other_rx) = recording_receiver();
        writer.register_receiver(None, own).await.unwrap();
        reader.register_receiver(None, other).await.unwrap();

        assert!(writer.send(Bytes::from_static(b"x"), 1).await.unwrap());
        assert_eq!(other_rx.try_recv().unwrap(), (Bytes::from_static(b"x"), 1));
        assert!(own_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registration_delivers_unseen_data() {
        let memory = Arc::new(VolatileMemory::new());
        let writer = VolatileDriver::new(&memory, &key());
        assert!(writer.send(Bytes::from_static(b"x"), 1).await.unwrap());

        let late = VolatileDriver::new(&memory, &key());
        let (receiver, mut rx) = recording_receiver();
        late.register_receiver(None, receiver).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), (Bytes::from_static(b"x"), 1));

        let current = VolatileDriver::new(&memory, &key());
        let (receiver, mut rx) = recording_receiver();
        current.register_receiver(writer.token(), receiver).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_receiver_is_rejected() {
        let memory = Arc::new(VolatileMemory::new());
        let driver = VolatileDriver::new(&memory, &key());
        let (first, _rx1) = recording_receiver();
        let (second, _rx2) = recording_receiver();
        driver.register_receiver(None, first).await.unwrap();
        assert!(matches!(
            driver.register_receiver(None, second).await,
            Err(DriverError::ReceiverAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn closed_driver_rejects_calls_and_stops_receiving() {
        let memory = Arc::new(VolatileMemory::new());
        let writer = VolatileDriver::new(&memory, &key());
        let reader = VolatileDriver::new(&memory, &key());
        let (receiver, mut rx) = recording_receiver();
        reader.register_receiver(None, receiver).await.unwrap();
        reader.close().await.unwrap();
        assert!(matches!(
            reader.send(Bytes::new(), 1).await,
            Err(DriverError::Closed(_))
        ));
        assert!(writer.send(Bytes::from_static(b"x"), 1).await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clone_opens_an_independent_connection() {
        let memory = Arc::new(VolatileMemory::new());
        let driver = VolatileDriver::new(&memory, &key());
        let (receiver, mut rx) = recording_receiver();
        driver.register_receiver(None, receiver).await.unwrap();
        let twin = driver.clone_driver().await.unwrap();
        assert!(twin.send(Bytes::from_static(b"y"), 1).await.unwrap());
        assert_eq!(rx.try_recv().unwrap().1, 1);
        assert_eq!(memory.keys(), vec![key()]);
    }
}
