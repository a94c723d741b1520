use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_types::ReferenceId;

/// Identifier a store hands out when a callback registers.
pub type CallbackId = u32;

/// Messages exchanged between proxies and stores, in both directions.
///
/// `id` names the callback the message came from (proxy to store) or is
/// addressed to (store to proxy). Stores never echo a message back to the
/// callback named as its sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "D: Serialize, O: Serialize",
    deserialize = "D: DeserializeOwned, O: DeserializeOwned"
))]
pub enum ProxyMessage<D, O> {
    /// Ask the other side for its full model.
    SyncRequest { id: Option<CallbackId> },
    /// A full model snapshot to merge.
    ModelUpdate { model: D, id: Option<CallbackId> },
    /// Operations to apply in order.
    Operations { operations: Vec<O>, id: Option<CallbackId> },
}

impl<D, O> ProxyMessage<D, O> {
    pub fn id(&self) -> Option<CallbackId> {
        match self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id,
        }
    }

    pub fn with_id(self, id: Option<CallbackId>) -> Self {
        match self {
            ProxyMessage::SyncRequest { .. } => ProxyMessage::SyncRequest { id },
            ProxyMessage::ModelUpdate { model, .. } => ProxyMessage::ModelUpdate { model, id },
            ProxyMessage::Operations { operations, .. } => {
                ProxyMessage::Operations { operations, id }
            }
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ProxyMessage::SyncRequest { .. } => MessageKind::SyncRequest,
            ProxyMessage::ModelUpdate { .. } => MessageKind::ModelUpdate,
            ProxyMessage::Operations { .. } => MessageKind::Operations,
        }
    }
}

/// A [`ProxyMessage`] addressed to one entity of a backing store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "D: Serialize, O: Serialize",
    deserialize = "D: DeserializeOwned, O: DeserializeOwned"
))]
pub struct MuxedProxyMessage<D, O> {
    pub mux_id: ReferenceId,
    pub message: ProxyMessage<D, O>,
}

impl<D, O> MuxedProxyMessage<D, O> {
    pub fn new(mux_id: impl Into<ReferenceId>, message: ProxyMessage<D, O>) -> Self {
        Self {
            mux_id: mux_id.into(),
            message,
        }
    }
}

/// Discriminant of a [`ProxyMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    SyncRequest,
    ModelUpdate,
    Operations,
}

impl MessageKind {
    /// Tag byte used in framed envelopes.
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::SyncRequest => 1,
            MessageKind::ModelUpdate => 2,
            MessageKind::Operations => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::SyncRequest),
            2 => Some(MessageKind::ModelUpdate),
            3 => Some(MessageKind::Operations),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::SyncRequest => "SyncRequest",
            MessageKind::ModelUpdate => "ModelUpdate",
            MessageKind::Operations => "Operations",
        }
    }
}
