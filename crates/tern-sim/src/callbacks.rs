//! Subscriber callbacks used by the scenarios.
//!
//! Each callback is shared behind an `Arc`; [`callback`] adapts one into a
//! closure the subscriber accepts while the scenario keeps observing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tern_subscriber::{CallbackError, CompletionSignal, Message, MessageCallback};
use thiserror::Error;

/// Attribute carrying the 1-based publish sequence number.
pub const SEQ_ATTRIBUTE: &str = "seq_num";

/// Something that handles a delivered message.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> Result<(), CallbackError>;
}

/// Wraps a shared handler as a subscriber callback.
pub fn callback<H: Handler>(handler: &Arc<H>) -> impl MessageCallback {
    let handler = Arc::clone(handler);
    move |message: Message| handler.handle(message)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acks every message, counting calls once the ack is done.
#[derive(Debug, Default)]
pub struct AckCallback {
    calls: AtomicU64,
}

impl AckCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Handler for AckCallback {
    fn handle(&self, message: Message) -> Result<(), CallbackError> {
        message.ack();
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TimesState {
    calls: u64,
    call_times: Vec<Instant>,
}

/// Sleeps before acking and records when each call started.
#[derive(Debug)]
pub struct TimesCallback {
    sleep_time: Duration,
    state: Mutex<TimesState>,
}

impl TimesCallback {
    pub fn new(sleep_time: Duration) -> Self {
        Self {
            sleep_time,
            state: Mutex::new(TimesState::default()),
        }
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    pub fn calls(&self) -> u64 {
        lock(&self.state).calls
    }

    /// Start times of finished calls, sorted ascending.
    pub fn call_times(&self) -> Vec<Instant> {
        let mut times = lock(&self.state).call_times.clone();
        times.sort();
        times
    }

    /// Gap between the first two call starts, once two calls finished.
    pub fn first_start_gap(&self) -> Option<Duration> {
        let times = self.call_times();
        match times.as_slice() {
            [first, second, ..] => Some(second.duration_since(*first)),
            _ => None,
        }
    }
}

impl Handler for TimesCallback {
    fn handle(&self, message: Message) -> Result<(), CallbackError> {
        let started = Instant::now();
        thread::sleep(self.sleep_time);
        message.ack();
        let mut state = lock(&self.state);
        state.call_times.push(started);
        state.calls += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StreamingState {
    pending_ack: usize,
    max_pending_ack: usize,
    completed_calls: u64,
    seen_message_ids: Vec<u64>,
}

/// Tracks concurrent callbacks and the sequence numbers it observed.
///
/// Resolves [`StreamingPullCallback::done`] once `resolve_at` calls have
/// completed.
#[derive(Debug)]
pub struct StreamingPullCallback {
    processing_time: Duration,
    resolve_at: u64,
    state: Mutex<StreamingState>,
    done: CompletionSignal,
}

impl StreamingPullCallback {
    pub fn new(processing_time: Duration, resolve_at: u64) -> Self {
        Self {
            processing_time,
            resolve_at,
            state: Mutex::new(StreamingState::default()),
            done: CompletionSignal::new(),
        }
    }

    pub fn done(&self) -> &CompletionSignal {
        &self.done
    }

    pub fn completed_calls(&self) -> u64 {
        lock(&self.state).completed_calls
    }

    pub fn max_pending_ack(&self) -> usize {
        lock(&self.state).max_pending_ack
    }

    pub fn seen_message_ids(&self) -> Vec<u64> {
        let mut seen = lock(&self.state).seen_message_ids.clone();
        seen.sort_unstable();
        seen
    }
}

impl Handler for StreamingPullCallback {
    fn handle(&self, message: Message) -> Result<(), CallbackError> {
        let seq = message
            .attribute(SEQ_ATTRIBUTE)
            .ok_or_else(|| CallbackError::msg(format!("message {} has no {SEQ_ATTRIBUTE}", message.id())))?
            .parse::<u64>()?;
        {
            let mut state = lock(&self.state);
            state.pending_ack += 1;
            state.max_pending_ack = state.max_pending_ack.max(state.pending_ack);
            state.seen_message_ids.push(seq);
        }

        thread::sleep(self.processing_time);

        let mut state = lock(&self.state);
        state.pending_ack -= 1;
        message.ack();
        state.completed_calls += 1;
        if state.completed_calls >= self.resolve_at {
            self.done.succeed();
        }
        Ok(())
    }
}

/// Error every [`FailingCallback`] invocation returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scenario callback rejected message {0}")]
pub struct ScenarioCallbackError(pub String);

/// Always fails without settling the message.
#[derive(Debug, Default)]
pub struct FailingCallback {
    calls: AtomicU64,
}

impl FailingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Handler for FailingCallback {
    fn handle(&self, message: Message) -> Result<(), CallbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ScenarioCallbackError(message.id().to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::{callback, AckCallback, StreamingPullCallback, TimesCallback, SEQ_ATTRIBUTE};
    use std::sync::Arc;
    use std::time::Duration;
    use tern_core::Attributes;
    use tern_source::InMemoryBroker;
    use tern_subscriber::{subscribe, Completion, SubscriberConfig};

    fn broker_with_seq(count: u64) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        for seq in 1..=count {
            let mut attributes = Attributes::new();
            attributes.insert(SEQ_ATTRIBUTE.to_string(), seq.to_string());
            broker
                .publish(format!("message {seq}").into_bytes(), attributes)
                .expect("publish");
        }
        broker.close();
        broker
    }

    #[test]
    fn ack_callback_counts_each_message() {
        let broker = broker_with_seq(5);
        let handler = Arc::new(AckCallback::new());
        let handle = subscribe(broker.source(), callback(&handler), SubscriberConfig::default())
            .expect("subscribe");
        assert_eq!(
            handle.result(Some(Duration::from_secs(10))).expect("drains"),
            Completion::Succeeded
        );
        assert_eq!(handler.calls(), 5);
    }

    #[test]
    fn times_callback_reports_no_gap_before_two_calls() {
        let handler = TimesCallback::new(Duration::from_millis(1));
        assert_eq!(handler.first_start_gap(), None);
        assert_eq!(handler.calls(), 0);
    }

    #[test]
    fn streaming_callback_resolves_after_expected_count() {
        let broker = broker_with_seq(4);
        let handler = Arc::new(StreamingPullCallback::new(Duration::from_millis(5), 4));
        let handle = subscribe(broker.source(), callback(&handler), SubscriberConfig::default())
            .expect("subscribe");
        handler
            .done()
            .wait(Some(Duration::from_secs(10)))
            .expect("done resolves");
        assert_eq!(handler.completed_calls(), 4);
        assert_eq!(handler.seen_message_ids(), vec![1, 2, 3, 4]);
        handle.cancel();
    }

    #[test]
    fn streaming_callback_rejects_messages_without_sequence() {
        let broker = InMemoryBroker::new();
        broker
            .publish(b"no seq".to_vec(), Attributes::new())
            .expect("publish");
        let handler = Arc::new(StreamingPullCallback::new(Duration::ZERO, 1));
        let handle = subscribe(broker.source(), callback(&handler), SubscriberConfig::default())
            .expect("subscribe");
        let err = handle
            .result(Some(Duration::from_secs(10)))
            .expect_err("missing attribute fails the subscription");
        assert!(err.to_string().contains(SEQ_ATTRIBUTE));
        assert_eq!(handler.completed_calls(), 0);
    }
}
