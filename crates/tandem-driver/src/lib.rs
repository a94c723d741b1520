//! Storage drivers for Tandem.
//!
//! A driver is the byte-level connection between a store and one storage
//! location. It accepts versioned writes, rejects writes that are not the
//! immediate successor of what it holds, and pushes changes made through
//! other connections to its single registered receiver.
//!
//! # Key Types
//!
//! - [`Driver`] -- One connection to a storage location
//! - [`DriverProvider`] -- Opens drivers for the protocols it serves
//! - [`DriverFactory`] -- Explicitly constructed list of providers
//! - [`VolatileMemory`] -- Shared in-process backing for [`VolatileDriver`]s

pub mod error;
pub mod factory;
pub mod traits;
pub mod volatile;

pub use error::{DriverError, DriverResult};
pub use factory::DriverFactory;
pub use traits::{receiver_fn, Driver, DriverProvider, DriverReceiver, ReceiverFuture};
pub use volatile::{VolatileDriver, VolatileDriverProvider, VolatileMemory};
