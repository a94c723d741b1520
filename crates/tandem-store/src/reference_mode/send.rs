use std::collections::VecDeque;

use super::hold::BlockId;

#[derive(Debug)]
enum Slot<S> {
    Ready(S),
    Blocked(BlockId, S),
}

/// Outbound sends, delivered strictly in enqueue order.
///
/// A blocked send holds back everything queued after it until it is released
/// or cancelled.
#[derive(Debug)]
pub struct SendQueue<S> {
    slots: VecDeque<Slot<S>>,
}

impl<S> Default for SendQueue<S> {
    fn default() -> Self {
        Self { slots: VecDeque::new() }
    }
}

impl<S> SendQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, send: S) {
        self.slots.push_back(Slot::Ready(send));
    }

    pub fn enqueue_blocking(&mut self, block: BlockId, send: S) {
        self.slots.push_back(Slot::Blocked(block, send));
    }

    /// Mark the send held by `block` ready. Returns `false` if it is unknown.
    pub fn release(&mut self, block: BlockId) -> bool {
        let Some(pos) = self.position(block) else {
            return false;
        };
        if let Some(Slot::Blocked(_, send)) = self.slots.remove(pos) {
            self.slots.insert(pos, Slot::Ready(send));
        }
        true
    }

    /// Take the send held by `block` out of the queue.
    pub fn cancel(&mut self, block: BlockId) -> Option<S> {
        let pos = self.position(block)?;
        match self.slots.remove(pos) {
            Some(Slot::Blocked(_, send)) => Some(send),
            _ => None,
        }
    }

    /// Pop every ready send from the front, stopping at the first blocked one.
    pub fn drain_ready(&mut self) -> Vec<S> {
        let mut ready = Vec::new();
        while matches!(self.slots.front(), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(send)) = self.slots.pop_front() {
                ready.push(send);
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn blocked(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Blocked(..))).count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn position(&self, block: BlockId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Blocked(b, _) if *b == block))
    }
}
