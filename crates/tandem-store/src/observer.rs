use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tandem_types::StorageKey;
use tracing::{debug, trace};

use crate::message::{CallbackId, MessageKind};

/// Where in the stack a message was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    DirectStore,
    BackingStore,
    ReferenceModeStore,
}

/// A copy of one inbound message, as seen by a [`StoreObserver`].
pub struct ObservedMessage<'a> {
    pub boundary: Boundary,
    pub storage_key: &'a StorageKey,
    pub kind: MessageKind,
    pub sender: Option<CallbackId>,
    pub mux_id: Option<&'a str>,
    pub message: &'a (dyn fmt::Debug + Sync),
}

#[derive(Debug, thiserror::Error)]
#[error("store observer failed: {0}")]
pub struct ObserverError(pub String);

/// Development hook that sees every inbound message at every store boundary.
///
/// Failures are logged and never affect message handling.
pub trait StoreObserver: Send + Sync {
    fn observe(&self, message: &ObservedMessage<'_>) -> Result<(), ObserverError>;
}

/// Writes every observed message at `trace` level.
pub struct LoggingObserver;

impl StoreObserver for LoggingObserver {
    fn observe(&self, message: &ObservedMessage<'_>) -> Result<(), ObserverError> {
        trace!(
            boundary = ?message.boundary,
            storage_key = %message.storage_key,
            kind = message.kind.name(),
            sender = ?message.sender,
            mux_id = ?message.mux_id,
            message = ?message.message,
            "store message"
        );
        Ok(())
    }
}

pub(crate) fn notify(observer: Option<&Arc<dyn StoreObserver>>, message: &ObservedMessage<'_>) {
    let Some(observer) = observer else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(|| observer.observe(message))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            debug!(storage_key = %message.storage_key, %error, "store observer failed")
        }
        Err(_) => debug!(storage_key = %message.storage_key, "store observer panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<MessageKind>>);

    impl StoreObserver for Recording {
        fn observe(&self, message: &ObservedMessage<'_>) -> Result<(), ObserverError> {
            self.0.lock().unwrap().push(message.kind);
            Ok(())
        }
    }

    struct Panicking;

    impl StoreObserver for Panicking {
        fn observe(&self, _message: &ObservedMessage<'_>) -> Result<(), ObserverError> {
            panic!("observer bug");
        }
    }

    fn observed(key: &StorageKey) -> ObservedMessage<'_> {
        ObservedMessage {
            boundary: Boundary::DirectStore,
            storage_key: key,
            kind: MessageKind::SyncRequest,
            sender: Some(1),
            mux_id: None,
            message: &"sync",
        }
    }

    #[test]
    fn observer_sees_messages() {
        let key = StorageKey::new("volatile", "x");
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let observer: Arc<dyn StoreObserver> = recording.clone();
        notify(Some(&observer), &observed(&key));
        assert_eq!(*recording.0.lock().unwrap(), vec![MessageKind::SyncRequest]);
    }

    #[test]
    fn observer_panics_are_contained() {
        let key = StorageKey::new("volatile", "x");
        let observer: Arc<dyn StoreObserver> = Arc::new(Panicking);
        notify(Some(&observer), &observed(&key));
        let logging: Arc<dyn StoreObserver> = Arc::new(LoggingObserver);
        notify(Some(&logging), &observed(&key));
        notify(None, &observed(&key));
    }
}
