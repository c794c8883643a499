//! Flow-controlled streaming-pull subscriber.
//!
//! This crate sits between a [`MessageSource`](tern_source::MessageSource)
//! and a user callback: it admits messages against flow-control ceilings,
//! runs the callback on a worker pool, tracks per-message ack/nack, and
//! exposes one completion outcome per subscription.

pub mod ack;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod stats;
pub mod subscription;

pub use ack::{AckState, Message};
pub use completion::{Completion, CompletionSignal, CompletionState};
pub use config::{FlowControlConfig, SubscriberConfig};
pub use dispatch::MessageCallback;
pub use error::{CallbackError, CallbackPanic, SubscriberError};
pub use flow::FlowController;
pub use stats::SubscriberStats;
pub use subscription::{subscribe, SubscriptionHandle, SubscriptionState};
