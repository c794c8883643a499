//! Message source abstractions for tern.
//!
//! The subscriber only depends on the pull/ack contract defined here; the
//! in-memory broker backs tests and simulations.

pub mod memory;
pub mod source;

pub use memory::{InMemoryBroker, InMemorySource};
pub use source::{MessageSource, SourceHealthSnapshot};
