use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rand::Rng;

use crate::message::{CallbackId, MuxedProxyMessage, ProxyMessage};

/// Receiver of messages pushed by a store.
#[async_trait]
pub trait Callback<T: Send + 'static>: Send + Sync {
    async fn deliver(&self, message: T);
}

/// A registered proxy-side receiver.
pub type ProxyCallback<D, O> = Arc<dyn Callback<ProxyMessage<D, O>>>;

/// A registered receiver of backing-store messages.
pub type MuxedCallback<D, O> = Arc<dyn Callback<MuxedProxyMessage<D, O>>>;

struct FnCallback<F>(F);

#[async_trait]
impl<T, F, Fut> Callback<T> for FnCallback<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn deliver(&self, message: T) {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a callback.
pub fn callback_fn<T, F, Fut>(f: F) -> Arc<dyn Callback<T>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

/// Registry of callbacks keyed by randomly chosen, non-colliding ids.
pub struct CallbackManager<T> {
    callbacks: RwLock<BTreeMap<CallbackId, Arc<dyn Callback<T>>>>,
}

impl<T> Default for CallbackManager<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Clone + Send + 'static> CallbackManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn Callback<T>>) -> CallbackId {
        let mut callbacks = self.callbacks.write().expect("callback lock poisoned");
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: CallbackId = rng.gen_range(1..=CallbackId::MAX);
            if !callbacks.contains_key(&candidate) {
                break candidate;
            }
        };
        callbacks.insert(id, callback);
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.callbacks
            .write()
            .expect("callback lock poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.callbacks.read().expect("callback lock poisoned").contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().expect("callback lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().expect("callback lock poisoned").len()
    }

    pub fn clear(&self) {
        self.callbacks.write().expect("callback lock poisoned").clear();
    }

    /// Deliver `message` to every callback except `except`, in id order.
    pub async fn send(&self, message: T, except: Option<CallbackId>) {
        let targets: Vec<Arc<dyn Callback<T>>> = self
            .callbacks
            .read()
            .expect("callback lock poisoned")
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in targets {
            callback.deliver(message.clone()).await;
        }
    }

    /// Deliver `message` to one callback. Returns `false` when `id` is unknown.
    pub async fn send_to(&self, id: CallbackId, message: T) -> bool {
        let target = self
            .callbacks
            .read()
            .expect("callback lock poisoned")
            .get(&id)
            .cloned();
        match target {
            Some(callback) => {
                callback.deliver(message).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recorder(
        tag: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, u32)>,
    ) -> Arc<dyn Callback<u32>> {
        callback_fn(move |n: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((tag, n));
            }
        })
    }

    #[tokio::test]
    async fn send_skips_the_excluded_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = CallbackManager::new();
        let a = manager.register(recorder("a", tx.clone()));
        let _b = manager.register(recorder("b", tx));
        manager.send(5, Some(a)).await;
        assert_eq!(rx.try_recv().unwrap(), ("b", 5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_targets_one_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = CallbackManager::new();
        let a = manager.register(recorder("a", tx.clone()));
        manager.register(recorder("b", tx));
        assert!(manager.send_to(a, 1).await);
        assert_eq!(rx.try_recv().unwrap(), ("a", 1));
        assert!(rx.try_recv().is_err());
        assert!(!manager.send_to(0, 1).await);
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let manager = CallbackManager::<u32>::new();
        let ids: Vec<CallbackId> = (0..64)
            .map(|_| manager.register(callback_fn(|_: u32| async {})))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(ids.iter().all(|id| *id != 0));
        assert!(manager.unregister(ids[0]));
        assert!(!manager.unregister(ids[0]));
        assert_eq!(manager.len(), 63);
    }
}
