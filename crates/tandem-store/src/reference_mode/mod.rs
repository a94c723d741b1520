//! Stores collections of entities as a container of references plus a
//! backing store holding one entity per child store.

mod hold;
mod queue;
mod send;
mod store;

pub use hold::{BlockId, HoldQueue};
pub use send::SendQueue;
pub use store::{ReferenceModeStore, RefModeData, RefModeMessage, RefModeOp};
