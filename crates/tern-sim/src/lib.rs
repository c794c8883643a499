//! Scenario drivers exercising the tern subscriber end to end against the
//! in-memory broker.

pub mod callbacks;
pub mod scenarios;

pub use callbacks::{
    callback, AckCallback, FailingCallback, Handler, ScenarioCallbackError, StreamingPullCallback,
    TimesCallback, SEQ_ATTRIBUTE,
};
pub use scenarios::{
    publish_messages, random_batch_sizes, run, Scenario, ScenarioDetail, ScenarioError,
    ScenarioReport, ScenarioSettings, MAX_MESSAGES_BATCH_SIZES, MAX_SLOWDOWN,
};
