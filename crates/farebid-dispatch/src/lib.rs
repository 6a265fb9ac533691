//! Async runtime layer for the Farebid dispatch engine.
//!
//! [`Dispatcher`] wires the pure core (matching, ledger, state machine) to a
//! [`DispatchStore`](farebid_core::store::DispatchStore), the geocoding and
//! routing collaborators, and the [`FanoutRouter`]. Every operation that
//! reads and writes a ride runs under that ride's lock.

pub mod dispatcher;
pub mod error;
pub mod eta;
pub mod fanout;
mod locks;
pub mod settings;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use eta::EtaEstimator;
pub use fanout::{ChannelSink, DeliveryError, EventSink, FanoutRouter};
pub use settings::DispatchSettings;

#[cfg(test)]
mod tests;
