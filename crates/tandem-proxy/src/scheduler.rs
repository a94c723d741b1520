use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use tandem_types::StorageKey;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::error::ProxyError;
use crate::handles::{ErrorCallback, Invocation};

/// Runs a proxy's handle callbacks one at a time, in scheduling order, on a
/// dedicated task. A panicking callback is reported to the error callback and
/// does not stop the ones after it.
pub(crate) struct Scheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<Invocation>>>>,
    depth: Arc<watch::Sender<usize>>,
}

impl Scheduler {
    pub fn new(storage_key: StorageKey, errors: Arc<RwLock<Option<ErrorCallback>>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth, _) = watch::channel(0usize);
        let depth = Arc::new(depth);
        tokio::spawn(run(rx, Arc::clone(&depth), errors, storage_key));
        Self {
            tx: Mutex::new(Some(tx)),
            depth,
        }
    }

    /// Queue a batch. Batches run in the order they were scheduled.
    pub fn schedule(&self, batch: Vec<Invocation>) {
        if batch.is_empty() {
            return;
        }
        let tx = self.tx.lock().expect("scheduler lock poisoned");
        let Some(tx) = tx.as_ref() else {
            debug!("dropping callbacks scheduled after shutdown");
            return;
        };
        self.depth.send_modify(|d| *d += 1);
        if tx.send(batch).is_err() {
            self.depth.send_modify(|d| *d = d.saturating_sub(1));
        }
    }

    /// Resolve once every scheduled batch has run.
    pub async fn idle(&self) {
        let mut rx = self.depth.subscribe();
        let _ = rx.wait_for(|d| *d == 0).await;
    }

    /// Stop accepting work. Batches already queued still run.
    pub fn shutdown(&self) {
        self.tx.lock().expect("scheduler lock poisoned").take();
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Vec<Invocation>>,
    depth: Arc<watch::Sender<usize>>,
    errors: Arc<RwLock<Option<ErrorCallback>>>,
    storage_key: StorageKey,
) {
    while let Some(batch) = rx.recv().await {
        for invocation in batch {
            run_one(invocation, &errors, &storage_key);
        }
        depth.send_modify(|d| *d = d.saturating_sub(1));
    }
}

fn run_one(
    invocation: Invocation,
    errors: &RwLock<Option<ErrorCallback>>,
    storage_key: &StorageKey,
) {
    let Invocation { handle, label, run } = invocation;
    let Err(panic) = catch_unwind(AssertUnwindSafe(run)) else {
        return;
    };
    let message = panic_message(panic.as_ref());
    let callback = errors.read().expect("error callback lock poisoned").clone();
    let Some(callback) = callback else {
        error!(
            storage_key = %storage_key,
            handle = %handle,
            label,
            message = %message,
            "handle callback panicked"
        );
        return;
    };
    let err = ProxyError::CallbackPanicked {
        handle: handle.to_string(),
        label,
        message,
    };
    if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
        error!(storage_key = %storage_key, handle = %handle, "error callback panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::HandleId;

    fn invocation(name: &str, run: impl FnOnce() + Send + 'static) -> Invocation {
        Invocation {
            handle: HandleId::new(name),
            label: "on_update",
            run: Box::new(run),
        }
    }

    #[tokio::test]
    async fn batches_run_in_order() {
        let errors = Arc::new(RwLock::new(None));
        let scheduler = Scheduler::new(StorageKey::new("volatile", "x"), errors);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            scheduler.schedule(vec![invocation("h", move || seen.lock().unwrap().push(i))]);
        }
        scheduler.idle().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn panics_reach_error_callback_and_later_callbacks_still_run() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let callback: ErrorCallback =
            Arc::new(move |e: ProxyError| sink.lock().unwrap().push(e.to_string()));
        let errors = Arc::new(RwLock::new(Some(callback)));
        let scheduler = Scheduler::new(StorageKey::new("volatile", "x"), errors);
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        scheduler.schedule(vec![
            invocation("bad", || panic!("boom")),
            invocation("good", move || *flag.lock().unwrap() = true),
        ]);
        scheduler.idle().await;
        assert!(*ran.lock().unwrap());
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("bad"));
        assert!(reported[0].contains("boom"));
    }

    #[tokio::test]
    async fn shutdown_drops_new_work() {
        let scheduler =
            Scheduler::new(StorageKey::new("volatile", "x"), Arc::new(RwLock::new(None)));
        scheduler.shutdown();
        scheduler.schedule(vec![invocation("h", || panic!("must not run"))]);
        scheduler.idle().await;
    }
}
