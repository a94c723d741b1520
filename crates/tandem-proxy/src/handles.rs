use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProxyError;

/// Identifies the handle a callback belongs to: a name within an optional
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    pub name: String,
    pub namespace: Option<String>,
}

impl HandleId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}::{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Coarse notification delivered to storage-event listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageEvent {
    Ready,
    Update,
    Desync,
    Resync,
}

pub type Action = Arc<dyn Fn() + Send + Sync>;
pub type UpdateAction<C> = Arc<dyn Fn(&C, &C) + Send + Sync>;
pub type EventAction = Arc<dyn Fn(StorageEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ProxyError) + Send + Sync>;

/// Which listener list a notification goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    Ready,
    Desync,
    Resync,
}

impl Signal {
    fn event(self) -> StorageEvent {
        match self {
            Signal::Ready => StorageEvent::Ready,
            Signal::Desync => StorageEvent::Desync,
            Signal::Resync => StorageEvent::Resync,
        }
    }

    /// A single invocation of `action`, for listeners that fire on registration.
    pub(crate) fn invoke(self, id: &HandleId, action: &Action) -> Invocation {
        let action = Arc::clone(action);
        Invocation {
            handle: id.clone(),
            label: self.label(),
            run: Box::new(move || action()),
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Signal::Ready => "on_ready",
            Signal::Desync => "on_desync",
            Signal::Resync => "on_resync",
        }
    }
}

/// One callback invocation, ready to run on the scheduler.
pub(crate) struct Invocation {
    pub handle: HandleId,
    pub label: &'static str,
    pub run: Box<dyn FnOnce() + Send>,
}

/// Listeners registered by handles, grouped per handle.
pub(crate) struct Handles<C> {
    on_ready: BTreeMap<HandleId, Vec<Action>>,
    on_update: BTreeMap<HandleId, Vec<UpdateAction<C>>>,
    on_desync: BTreeMap<HandleId, Vec<Action>>,
    on_resync: BTreeMap<HandleId, Vec<Action>>,
    events: BTreeMap<HandleId, Vec<EventAction>>,
}

impl<C> Default for Handles<C> {
    fn default() -> Self {
        Self {
            on_ready: BTreeMap::new(),
            on_update: BTreeMap::new(),
            on_desync: BTreeMap::new(),
            on_resync: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }
}

impl<C: Send + Sync + 'static> Handles<C> {
    pub fn add(&mut self, signal: Signal, id: HandleId, action: Action) {
        let list = match signal {
            Signal::Ready => &mut self.on_ready,
            Signal::Desync => &mut self.on_desync,
            Signal::Resync => &mut self.on_resync,
        };
        list.entry(id).or_default().push(action);
    }

    pub fn add_update(&mut self, id: HandleId, action: UpdateAction<C>) {
        self.on_update.entry(id).or_default().push(action);
    }

    pub fn add_events(&mut self, id: HandleId, action: EventAction) {
        self.events.entry(id).or_default().push(action);
    }

    pub fn remove(&mut self, id: &HandleId) {
        self.on_ready.remove(id);
        self.on_update.remove(id);
        self.on_desync.remove(id);
        self.on_resync.remove(id);
        self.events.remove(id);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.on_ready.is_empty()
            && self.on_update.is_empty()
            && self.on_desync.is_empty()
            && self.on_resync.is_empty()
            && self.events.is_empty()
    }

    /// Invocations for a ready, desync or resync notification: the matching
    /// listeners first, then storage-event listeners.
    pub fn signal(&self, signal: Signal) -> Vec<Invocation> {
        let list = match signal {
            Signal::Ready => &self.on_ready,
            Signal::Desync => &self.on_desync,
            Signal::Resync => &self.on_resync,
        };
        let mut out: Vec<Invocation> = list
            .iter()
            .flat_map(|(id, actions)| {
                actions.iter().map(move |action| {
                    let action = Arc::clone(action);
                    Invocation {
                        handle: id.clone(),
                        label: signal.label(),
                        run: Box::new(move || action()),
                    }
                })
            })
            .collect();
        out.extend(self.events_for(signal.event()));
        out
    }

    pub fn update(&self, old: Arc<C>, new: Arc<C>) -> Vec<Invocation> {
        let mut out: Vec<Invocation> = self
            .on_update
            .iter()
            .flat_map(|(id, actions)| {
                let (old, new) = (Arc::clone(&old), Arc::clone(&new));
                actions.iter().map(move |action| {
                    let action = Arc::clone(action);
                    let (old, new) = (Arc::clone(&old), Arc::clone(&new));
                    Invocation {
                        handle: id.clone(),
                        label: "on_update",
                        run: Box::new(move || action(&old, &new)),
                    }
                })
            })
            .collect();
        out.extend(self.events_for(StorageEvent::Update));
        out
    }

    fn events_for(&self, event: StorageEvent) -> Vec<Invocation> {
        self.events
            .iter()
            .flat_map(|(id, actions)| {
                actions.iter().map(move |action| {
                    let action = Arc::clone(action);
                    Invocation {
                        handle: id.clone(),
                        label: "storage_event",
                        run: Box::new(move || action(event)),
                    }
                })
            })
            .collect()
    }
}
