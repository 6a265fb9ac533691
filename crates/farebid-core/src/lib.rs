//! Core types and algorithms for the Farebid dispatch engine.
//!
//! This crate has no runtime, transport, or database dependencies. Matching,
//! the negotiation ledger, and the ride state machine are plain synchronous
//! code over owned values. The collaborator and store seams are traits with
//! `Send` futures; the async layers live in `farebid-dispatch` and the
//! storage backends.

pub mod chat;
pub mod driver;
pub mod error;
pub mod event;
pub mod geo;
pub mod lifecycle;
pub mod matching;
pub mod negotiation;
pub mod ride;
pub mod route;
pub mod store;

pub use error::{Error, ErrorKind, Result};
