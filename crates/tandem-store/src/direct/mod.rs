//! A store that owns one CRDT model and keeps one driver in step with it.

pub mod state;
mod store;

pub use state::StoreState;
pub use store::DirectStore;
