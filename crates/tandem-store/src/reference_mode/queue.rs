use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// Single-consumer work queue that tracks how many items are outstanding.
///
/// An item counts as outstanding from `push` until the consumer calls
/// [`ReceiveQueue::done`] for it.
pub(crate) struct ReceiveQueue<W> {
    tx: mpsc::UnboundedSender<W>,
    depth: Arc<watch::Sender<usize>>,
}

impl<W> Clone for ReceiveQueue<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<W> ReceiveQueue<W> {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<W>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth, _) = watch::channel(0);
        (
            Self {
                tx,
                depth: Arc::new(depth),
            },
            rx,
        )
    }

    /// Returns `false` once the consumer is gone.
    pub(crate) fn push(&self, work: W) -> bool {
        self.depth.send_modify(|d| *d += 1);
        if self.tx.send(work).is_err() {
            self.depth.send_modify(|d| *d = d.saturating_sub(1));
            return false;
        }
        true
    }

    pub(crate) fn done(&self) {
        self.depth.send_modify(|d| *d = d.saturating_sub(1));
    }

    pub(crate) fn depth(&self) -> usize {
        *self.depth.borrow()
    }

    pub(crate) async fn drained(&self) {
        let mut rx = self.depth.subscribe();
        let _ = rx.wait_for(|d| *d == 0).await;
    }
}
