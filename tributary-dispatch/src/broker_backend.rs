//! Broker backends usable behind the dispatch core's capability seam.
//!
//! Only the in-memory backend lives here; real transports implement the
//! same traits in their own crates.

pub mod in_memory;

pub use in_memory::{InMemoryBroker, InMemoryTransport};
