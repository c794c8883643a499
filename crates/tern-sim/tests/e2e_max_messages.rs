use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tern_sim::{
    publish_messages, random_batch_sizes, run, Scenario, ScenarioDetail, ScenarioSettings,
    MAX_SLOWDOWN, SEQ_ATTRIBUTE,
};
use tern_source::InMemoryBroker;
use tern_subscriber::{
    subscribe, CallbackError, Completion, FlowControlConfig, Message, SubscriberConfig,
};

#[test]
fn e2e_max_messages_caps_pending_callbacks() {
    let settings = ScenarioSettings {
        time_unit: Duration::from_millis(50),
        timeout_units: 200,
        ..ScenarioSettings::default()
    };
    let report = run(Scenario::MaxMessages, &settings).expect("max messages scenario");
    match report.detail {
        ScenarioDetail::MaxMessages {
            total,
            max_messages,
            completed_calls,
            max_pending_ack,
            peak_pending,
            ideal_ms,
        } => {
            assert_eq!(total, 50);
            assert_eq!(max_messages, 5);
            assert_eq!(completed_calls, 50);
            assert_eq!(max_pending_ack, 5);
            assert!(peak_pending <= 5);
            assert_eq!(ideal_ms, 500);
            // Publishing, the settle pause and shutdown all count here.
            assert!(
                report.elapsed_ms <= ideal_ms * u64::from(MAX_SLOWDOWN),
                "took {}ms against an ideal of {ideal_ms}ms",
                report.elapsed_ms
            );
        }
        other => panic!("unexpected detail {other:?}"),
    }
    assert_eq!(report.stats.completed_calls, 50);
    assert!(report.stats.held_back > 0);
}

#[test]
fn e2e_random_batches_and_jitter_respect_flow_control() {
    for seed in [3_u64, 11, 42] {
        let mut rng = StdRng::seed_from_u64(seed);
        let total = rng.gen_range(20..60);
        let max_messages = rng.gen_range(1..8);
        let batches = random_batch_sizes(seed, total, 9);
        let jitter: Vec<Duration> = (0..total)
            .map(|_| Duration::from_millis(rng.gen_range(0..6)))
            .collect();

        let broker = InMemoryBroker::new();
        publish_messages(&broker, &batches, Duration::ZERO).expect("publish");
        broker.close();

        let pending = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (cb_pending, cb_peak, cb_seen) =
            (Arc::clone(&pending), Arc::clone(&peak), Arc::clone(&seen));

        let handle = subscribe(
            broker.source(),
            move |msg: Message| -> Result<(), CallbackError> {
                let seq: usize = msg
                    .attribute(SEQ_ATTRIBUTE)
                    .expect("seq attribute")
                    .parse()
                    .expect("numeric seq");
                let now = cb_pending.fetch_add(1, Ordering::SeqCst) + 1;
                cb_peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(jitter[seq - 1]);
                cb_pending.fetch_sub(1, Ordering::SeqCst);
                cb_seen.lock().expect("seen lock").push(seq);
                msg.ack();
                Ok(())
            },
            SubscriberConfig {
                poll_interval: Duration::from_millis(1),
                ..SubscriberConfig::with_flow_control(FlowControlConfig::with_max_messages(
                    max_messages,
                ))
            },
        )
        .expect("subscribe");

        let outcome = handle
            .result(Some(Duration::from_secs(20)))
            .expect("subscription drains");
        assert_eq!(outcome, Completion::Succeeded, "seed {seed}");
        assert!(peak.load(Ordering::SeqCst) <= max_messages, "seed {seed}");
        assert!(handle.flow_controller().peak_pending() <= max_messages, "seed {seed}");

        let mut seen = seen.lock().expect("seen lock").clone();
        seen.sort_unstable();
        assert_eq!(seen, (1..=total).collect::<Vec<_>>(), "seed {seed}");
        assert_eq!(broker.acked_count(), total as u64, "seed {seed}");
    }
}

#[test]
fn e2e_byte_ceiling_bounds_pending_payload() {
    let broker = InMemoryBroker::new();
    publish_messages(&broker, &[6, 6, 6], Duration::ZERO).expect("publish");
    broker.close();
    // Every payload is "message i/6" (11 bytes): two fit under 25 bytes.
    let flow = FlowControlConfig {
        max_messages: 100,
        max_bytes: Some(25),
    };
    let handle = subscribe(
        broker.source(),
        |msg: Message| -> Result<(), CallbackError> {
            thread::sleep(Duration::from_millis(2));
            msg.ack();
            Ok(())
        },
        SubscriberConfig::with_flow_control(flow),
    )
    .expect("subscribe");

    handle
        .result(Some(Duration::from_secs(10)))
        .expect("subscription drains");
    assert!(handle.flow_controller().peak_pending_bytes() <= 25);
    assert!(handle.flow_controller().peak_pending() <= 2);
    assert_eq!(handle.stats().acked, 18);
}
