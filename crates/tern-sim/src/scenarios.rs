use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tern_core::{Attributes, MessageId, SourceError};
use tern_source::InMemoryBroker;
use tern_subscriber::{
    subscribe, Completion, FlowControlConfig, SubscriberConfig, SubscriberError, SubscriberStats,
    SubscriptionHandle,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::callbacks::{
    callback, AckCallback, FailingCallback, ScenarioCallbackError, StreamingPullCallback,
    TimesCallback, SEQ_ATTRIBUTE,
};

/// Batch shape of the max-messages scenario (50 messages total).
pub const MAX_MESSAGES_BATCH_SIZES: [usize; 10] = [7, 4, 8, 2, 10, 1, 3, 8, 6, 1];

/// How far behind the ideal pace the max-messages scenario may fall.
pub const MAX_SLOWDOWN: u32 = 6;

const PUBLISH_PAYLOAD: &[u8] = b"The hail in Wales falls mainly on the snails.";
const SUBSCRIBE_PAYLOAD: &[u8] = b"Wooooo! The claaaaaw!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Publish many messages and consume them all.
    Publish,
    /// Every published message reaches an acking callback.
    Subscribe,
    /// Callbacks for different messages overlap in time.
    AsyncCallbacks,
    /// Pending messages never exceed `max_messages`.
    MaxMessages,
    /// A failing callback surfaces through the subscription result.
    CallbackError,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::Publish,
        Scenario::Subscribe,
        Scenario::AsyncCallbacks,
        Scenario::MaxMessages,
        Scenario::CallbackError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::Publish => "publish",
            Scenario::Subscribe => "subscribe",
            Scenario::AsyncCallbacks => "async-callbacks",
            Scenario::MaxMessages => "max-messages",
            Scenario::CallbackError => "callback-error",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = ScenarioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == normalized)
            .ok_or_else(|| ScenarioError::UnknownScenario(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),
    #[error("{scenario} check failed: {reason}")]
    Check { scenario: Scenario, reason: String },
}

fn check(scenario: Scenario, ok: bool, reason: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if ok {
        Ok(())
    } else {
        Err(ScenarioError::Check {
            scenario,
            reason: reason(),
        })
    }
}

/// Knobs shared by all scenarios.
///
/// Sleeps and waits are expressed in multiples of `time_unit`, so a suite
/// written against one-second units runs in milliseconds.
#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    pub time_unit: Duration,
    /// Upper bound in time units for any single wait.
    pub timeout_units: u32,
    pub publish_count: usize,
    pub subscribe_count: usize,
    pub batch_sizes: Vec<usize>,
    pub max_messages: usize,
    pub subscriber: SubscriberConfig,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_millis(50),
            timeout_units: 60,
            publish_count: 500,
            subscribe_count: 50,
            batch_sizes: MAX_MESSAGES_BATCH_SIZES.to_vec(),
            max_messages: 5,
            subscriber: SubscriberConfig::default(),
        }
    }
}

impl ScenarioSettings {
    /// `count` time units, saturating at `Duration::MAX`.
    pub fn units(&self, count: u32) -> Duration {
        self.time_unit.checked_mul(count).unwrap_or(Duration::MAX)
    }

    pub fn timeout(&self) -> Duration {
        self.units(self.timeout_units)
    }

    /// Subscriber config a scenario runs with. Only the message ceiling is
    /// scenario-specific; the byte ceiling and the rest come from `subscriber`.
    pub fn subscriber_config_for(&self, scenario: Scenario) -> SubscriberConfig {
        let max_messages = match scenario {
            Scenario::Publish => FlowControlConfig::unlimited().max_messages,
            Scenario::MaxMessages => self.max_messages,
            Scenario::Subscribe | Scenario::AsyncCallbacks | Scenario::CallbackError => {
                return self.subscriber.clone()
            }
        };
        SubscriberConfig {
            flow_control: FlowControlConfig {
                max_messages,
                ..self.subscriber.flow_control
            },
            ..self.subscriber.clone()
        }
    }
}

/// Scenario-specific observations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioDetail {
    Publish {
        published: usize,
        observed: u64,
    },
    Subscribe {
        published: usize,
        calls: u64,
    },
    AsyncCallbacks {
        start_gap_ms: u64,
        sleep_ms: u64,
    },
    MaxMessages {
        total: usize,
        max_messages: usize,
        completed_calls: u64,
        max_pending_ack: usize,
        peak_pending: usize,
        ideal_ms: u64,
    },
    CallbackError {
        error: String,
        callback_calls: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub elapsed_ms: u64,
    pub stats: SubscriberStats,
    pub detail: ScenarioDetail,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Polls `done` every tenth of a unit until it holds or `timeout` elapses.
fn poll_until(settings: &ScenarioSettings, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now().checked_add(settings.timeout());
    let step = (settings.time_unit / 10).max(Duration::from_millis(1));
    while deadline.map_or(true, |deadline| Instant::now() < deadline) {
        if done() {
            return true;
        }
        thread::sleep(step);
    }
    done()
}

/// Cancels and waits for the drain; a cancel outcome is expected.
fn shut_down(
    scenario: Scenario,
    handle: &SubscriptionHandle,
    settings: &ScenarioSettings,
) -> Result<(), ScenarioError> {
    handle.cancel();
    let outcome = handle.result(Some(settings.timeout()))?;
    debug!(%scenario, ?outcome, "subscription shut down");
    Ok(())
}

fn numbered(key: &str, value: impl ToString) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(key.to_string(), value.to_string());
    attributes
}

/// Publishes `sum(batch_sizes)` messages, one batch at a time with `gap`
/// between batches. Each carries its 1-based sequence in `seq_num`.
pub fn publish_messages(
    broker: &InMemoryBroker,
    batch_sizes: &[usize],
    gap: Duration,
) -> Result<Vec<MessageId>, SourceError> {
    let mut ids = Vec::with_capacity(batch_sizes.iter().sum());
    let mut seq = 0u64;
    for &count in batch_sizes {
        let batch: Vec<(Bytes, Attributes)> = (1..=count)
            .map(|index| {
                seq += 1;
                (
                    Bytes::from(format!("message {index}/{count}")),
                    numbered(SEQ_ATTRIBUTE, seq),
                )
            })
            .collect();
        ids.extend(broker.publish_batch(batch)?);
        if !gap.is_zero() {
            thread::sleep(gap);
        }
    }
    Ok(ids)
}

/// Random batch shape summing to `total`, each batch in `1..=max_batch`.
pub fn random_batch_sizes(seed: u64, total: usize, max_batch: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let max_batch = max_batch.max(1);
    let mut remaining = total;
    let mut sizes = Vec::new();
    while remaining > 0 {
        let size = rng.gen_range(1..=max_batch.min(remaining));
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

pub fn run(scenario: Scenario, settings: &ScenarioSettings) -> Result<ScenarioReport, ScenarioError> {
    info!(%scenario, time_unit = ?settings.time_unit, "running scenario");
    let started = Instant::now();
    let (stats, detail) = match scenario {
        Scenario::Publish => publish(settings)?,
        Scenario::Subscribe => subscribe_all(settings)?,
        Scenario::AsyncCallbacks => async_callbacks(settings)?,
        Scenario::MaxMessages => max_messages(settings)?,
        Scenario::CallbackError => callback_error(settings)?,
    };
    let report = ScenarioReport {
        scenario,
        elapsed_ms: millis(started.elapsed()),
        stats,
        detail,
    };
    info!(%scenario, elapsed_ms = report.elapsed_ms, "scenario passed");
    Ok(report)
}

fn publish(settings: &ScenarioSettings) -> Result<(SubscriberStats, ScenarioDetail), ScenarioError> {
    let scenario = Scenario::Publish;
    let broker = InMemoryBroker::new();
    let mut ids = Vec::with_capacity(settings.publish_count);
    for index in 0..settings.publish_count {
        ids.push(broker.publish(Bytes::from_static(PUBLISH_PAYLOAD), numbered("num", index))?);
    }
    let unique: HashSet<&MessageId> = ids.iter().collect();
    check(scenario, unique.len() == ids.len(), || {
        format!("{} duplicate message ids", ids.len() - unique.len())
    })?;
    check(scenario, ids.iter().all(|id| !id.as_str().is_empty()), || {
        "empty message id".to_string()
    })?;
    broker.close();

    let handler = Arc::new(AckCallback::new());
    let handle = subscribe(
        broker.source(),
        callback(&handler),
        settings.subscriber_config_for(scenario),
    )?;
    let outcome = handle.result(Some(settings.timeout()))?;
    check(scenario, outcome == Completion::Succeeded, || {
        format!("expected drained subscription, got {outcome:?}")
    })?;
    let observed = handler.calls();
    check(scenario, observed == ids.len() as u64, || {
        format!("observed {observed} of {} messages", ids.len())
    })?;
    check(scenario, broker.acked_count() == ids.len() as u64, || {
        format!("broker recorded {} acks", broker.acked_count())
    })?;

    Ok((
        handle.stats(),
        ScenarioDetail::Publish {
            published: ids.len(),
            observed,
        },
    ))
}

fn subscribe_all(settings: &ScenarioSettings) -> Result<(SubscriberStats, ScenarioDetail), ScenarioError> {
    let scenario = Scenario::Subscribe;
    let broker = InMemoryBroker::new();
    for index in 0..settings.subscribe_count {
        broker.publish(Bytes::from_static(SUBSCRIBE_PAYLOAD), numbered("num", index))?;
    }

    let handler = Arc::new(AckCallback::new());
    let handle = subscribe(
        broker.source(),
        callback(&handler),
        settings.subscriber_config_for(scenario),
    )?;
    let expected = settings.subscribe_count as u64;
    let reached = poll_until(settings, || handler.calls() >= expected);
    shut_down(scenario, &handle, settings)?;
    let calls = handler.calls();
    check(scenario, reached, || {
        format!("only {calls} of {expected} callbacks within {:?}", settings.timeout())
    })?;

    Ok((
        handle.stats(),
        ScenarioDetail::Subscribe {
            published: settings.subscribe_count,
            calls,
        },
    ))
}

fn async_callbacks(settings: &ScenarioSettings) -> Result<(SubscriberStats, ScenarioDetail), ScenarioError> {
    let scenario = Scenario::AsyncCallbacks;
    let broker = InMemoryBroker::new();
    for index in 0..2 {
        broker.publish(Bytes::from_static(SUBSCRIBE_PAYLOAD), numbered("num", index))?;
    }

    let handler = Arc::new(TimesCallback::new(settings.units(2)));
    let handle = subscribe(
        broker.source(),
        callback(&handler),
        settings.subscriber_config_for(scenario),
    )?;
    let reached = poll_until(settings, || handler.calls() >= 2);
    shut_down(scenario, &handle, settings)?;
    check(scenario, reached, || {
        format!("only {} of 2 callbacks finished", handler.calls())
    })?;

    let gap = handler.first_start_gap().unwrap_or(Duration::MAX);
    check(scenario, gap < handler.sleep_time(), || {
        format!(
            "callbacks ran sequentially: start gap {gap:?} >= sleep {:?}",
            handler.sleep_time()
        )
    })?;

    Ok((
        handle.stats(),
        ScenarioDetail::AsyncCallbacks {
            start_gap_ms: millis(gap),
            sleep_ms: millis(handler.sleep_time()),
        },
    ))
}

fn max_messages(settings: &ScenarioSettings) -> Result<(SubscriberStats, ScenarioDetail), ScenarioError> {
    let scenario = Scenario::MaxMessages;
    let broker = InMemoryBroker::new();
    publish_messages(&broker, &settings.batch_sizes, settings.time_unit / 10)?;
    let total: usize = settings.batch_sizes.iter().sum();

    let handler = Arc::new(StreamingPullCallback::new(settings.time_unit, total as u64));
    let started = Instant::now();
    let handle = subscribe(
        broker.source(),
        callback(&handler),
        settings.subscriber_config_for(scenario),
    )?;

    let resolved = handler.done().wait(Some(settings.timeout()));
    let processing = started.elapsed();
    // Give extra deliveries a chance to show up.
    thread::sleep(settings.units(3));
    shut_down(scenario, &handle, settings)?;
    resolved?;

    let completed_calls = handler.completed_calls();
    check(scenario, completed_calls == total as u64, || {
        format!("{completed_calls} completed calls for {total} messages")
    })?;
    let seen = handler.seen_message_ids();
    let expected: Vec<u64> = (1..=total as u64).collect();
    check(scenario, seen == expected, || {
        format!("sequence numbers not seen exactly once: {seen:?}")
    })?;
    let max_pending_ack = handler.max_pending_ack();
    check(scenario, max_pending_ack <= settings.max_messages, || {
        format!("{max_pending_ack} callbacks pending at once")
    })?;
    check(scenario, max_pending_ack == settings.max_messages.min(total), || {
        format!(
            "only {max_pending_ack} callbacks pending at once; ceiling is {}",
            settings.max_messages
        )
    })?;
    let peak_pending = handle.flow_controller().peak_pending();
    check(scenario, peak_pending <= settings.max_messages, || {
        format!("flow controller peaked at {peak_pending}")
    })?;

    let rounds = u32::try_from(total.div_ceil(settings.max_messages)).unwrap_or(u32::MAX);
    let ideal = settings.units(rounds);
    let bound = ideal.checked_mul(MAX_SLOWDOWN).unwrap_or(Duration::MAX);
    check(scenario, processing <= bound, || {
        format!(
            "took {}ms to process {total} messages; ideal is {}ms",
            millis(processing),
            millis(ideal)
        )
    })?;
    Ok((
        handle.stats(),
        ScenarioDetail::MaxMessages {
            total,
            max_messages: settings.max_messages,
            completed_calls,
            max_pending_ack,
            peak_pending,
            ideal_ms: millis(ideal),
        },
    ))
}

fn callback_error(settings: &ScenarioSettings) -> Result<(SubscriberStats, ScenarioDetail), ScenarioError> {
    let scenario = Scenario::CallbackError;
    let broker = InMemoryBroker::new();
    broker.publish(Bytes::from_static(b"hello!"), Attributes::new())?;

    let handler = Arc::new(FailingCallback::new());
    let handle = subscribe(
        broker.source(),
        callback(&handler),
        settings.subscriber_config_for(scenario),
    )?;
    let err = match handle.result(Some(settings.timeout())) {
        Ok(outcome) => {
            return Err(ScenarioError::Check {
                scenario,
                reason: format!("expected callback failure, got {outcome:?}"),
            })
        }
        Err(err) => err,
    };
    let is_scenario_error = err
        .as_callback()
        .is_some_and(|callback_err| callback_err.is::<ScenarioCallbackError>());
    check(scenario, is_scenario_error, || {
        format!("unexpected error type: {err}")
    })?;
    handle.join();

    Ok((
        handle.stats(),
        ScenarioDetail::CallbackError {
            error: err.to_string(),
            callback_calls: handler.calls(),
        },
    ))
}
