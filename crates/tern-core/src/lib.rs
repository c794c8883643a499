//! Core tern primitives shared across crates.
//!
//! Includes the wire-level message record, id hashing, and base errors.

pub mod error;
pub mod hash;
pub mod types;

pub use error::SourceError;
pub use types::{Attributes, MessageId, ReceivedMessage};
