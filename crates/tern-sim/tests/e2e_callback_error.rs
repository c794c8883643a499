use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tern_core::Attributes;
use tern_sim::{run, Scenario, ScenarioCallbackError, ScenarioDetail, ScenarioSettings};
use tern_source::InMemoryBroker;
use tern_subscriber::{subscribe, CallbackError, Message, SubscriberConfig};

#[test]
fn e2e_callback_error_propagates_through_result() {
    let settings = ScenarioSettings {
        time_unit: Duration::from_millis(10),
        timeout_units: 30,
        ..ScenarioSettings::default()
    };
    let started = Instant::now();
    let report = run(Scenario::CallbackError, &settings).expect("callback error scenario");
    assert!(started.elapsed() < Duration::from_secs(5));
    match report.detail {
        ScenarioDetail::CallbackError {
            error,
            callback_calls,
        } => {
            assert!(error.contains("scenario callback rejected"), "{error}");
            assert!(callback_calls >= 1);
        }
        other => panic!("unexpected detail {other:?}"),
    }
    assert_eq!(report.stats.acked, 0);
}

#[test]
fn e2e_first_error_wins_while_other_callbacks_run() {
    let broker = InMemoryBroker::new();
    for index in 0..6 {
        let mut attributes = Attributes::new();
        attributes.insert("num".to_string(), index.to_string());
        broker
            .publish(b"payload".to_vec(), attributes)
            .expect("publish");
    }
    let finished = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&finished);

    let handle = subscribe(
        broker.source(),
        move |msg: Message| -> Result<(), CallbackError> {
            if msg.attribute("num") == Some("0") {
                return Err(CallbackError::new(ScenarioCallbackError(msg.id().to_string())));
            }
            thread::sleep(Duration::from_millis(100));
            msg.ack();
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        SubscriberConfig::default(),
    )
    .expect("subscribe");

    let err = handle
        .result(Some(Duration::from_secs(10)))
        .expect_err("first callback fails");
    let callback_err = err.as_callback().expect("callback error");
    assert!(callback_err.is::<ScenarioCallbackError>());

    handle.join();
    // In-flight callbacks were allowed to finish and their acks reached the broker.
    let finished = finished.load(Ordering::SeqCst) as u64;
    assert_eq!(broker.acked_count(), finished);
    assert_eq!(broker.outstanding_len(), 0);
    assert_eq!(broker.ready_len() as u64 + finished, 6);
    assert_eq!(handle.stats().callback_errors, 1);
}
