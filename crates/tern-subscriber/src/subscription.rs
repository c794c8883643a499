use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tern_source::MessageSource;
use tracing::{info, warn};

use crate::ack::AckTracker;
use crate::completion::{Completion, CompletionSignal, CompletionState};
use crate::config::SubscriberConfig;
use crate::dispatch::{run_worker, DispatchShared, Intake, MessageCallback};
use crate::error::SubscriberError;
use crate::flow::FlowController;
use crate::stats::{SubscriberStats, SubscriberStatsInner};

/// Observable lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    /// Cancel requested; in-flight callbacks are draining.
    Cancelling,
    Cancelled,
    /// Succeeded or failed.
    Settled,
}

/// Control surface of a running subscription.
///
/// Dropping the handle cancels the subscription and joins its threads.
pub struct SubscriptionHandle {
    shared: Arc<DispatchShared>,
    stats: Arc<SubscriberStatsInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Starts delivering messages from `source` to `callback`.
///
/// Spawns one intake thread that owns the source and `max_workers` callback
/// threads. At most `flow_control.max_messages` messages (and
/// `flow_control.max_bytes` payload bytes) are pending at any time.
pub fn subscribe<S, C>(
    source: S,
    callback: C,
    config: SubscriberConfig,
) -> Result<SubscriptionHandle, SubscriberError>
where
    S: MessageSource,
    C: MessageCallback,
{
    config.validate()?;

    let flow = Arc::new(FlowController::new(config.flow_control));
    let stats = Arc::new(SubscriberStatsInner::default());
    let (events_tx, events_rx) = mpsc::channel();
    let (jobs_tx, jobs_rx) = mpsc::channel();
    let shared = Arc::new(DispatchShared {
        signal: CompletionSignal::new(),
        cancel_requested: AtomicBool::new(false),
        in_flight: AtomicUsize::new(0),
        events: events_tx.clone(),
        stats: Arc::clone(&stats),
        flow: Arc::clone(&flow),
    });
    let tracker = Arc::new(AckTracker::new(flow, events_tx, Arc::clone(&stats)));
    let callback: Arc<dyn MessageCallback> = Arc::new(callback);
    let jobs_rx = Arc::new(Mutex::new(jobs_rx));

    let handle = SubscriptionHandle {
        shared: Arc::clone(&shared),
        stats,
        threads: Mutex::new(Vec::with_capacity(config.max_workers + 1)),
    };

    for index in 0..config.max_workers {
        let jobs = Arc::clone(&jobs_rx);
        let callback = Arc::clone(&callback);
        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{index}", config.thread_name))
            .spawn(move || run_worker(jobs, callback, worker_shared));
        match spawned {
            Ok(worker) => handle.push_thread(worker),
            Err(err) => {
                // Workers exit once the job sender is gone; dropping
                // `handle` then joins them.
                drop(jobs_tx);
                return Err(SubscriberError::Spawn(err.to_string()));
            }
        }
    }

    let intake = Intake {
        source,
        tracker,
        shared,
        events: events_rx,
        jobs: jobs_tx,
        poll_interval: config.poll_interval,
    };
    let spawned = thread::Builder::new()
        .name(format!("{}-intake", config.thread_name))
        .spawn(move || intake.run());
    match spawned {
        Ok(intake) => handle.push_thread(intake),
        Err(err) => {
            // The closure owning the jobs sender is gone, so workers exit.
            handle.shared.request_cancel();
            return Err(SubscriberError::Spawn(err.to_string()));
        }
    }

    info!(
        max_messages = config.flow_control.max_messages,
        max_bytes = ?config.flow_control.max_bytes,
        max_workers = config.max_workers,
        "subscription started"
    );
    Ok(handle)
}

impl SubscriptionHandle {
    fn push_thread(&self, handle: JoinHandle<()>) {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Stops admitting messages and lets in-flight callbacks finish.
    ///
    /// Idempotent and non-blocking; the subscription settles as cancelled
    /// once drained (unless it already settled).
    pub fn cancel(&self) {
        if self.shared.request_cancel() {
            info!("subscription cancel requested");
        }
    }

    /// Waits up to `timeout` (`None` = forever) for the subscription outcome.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Completion, SubscriberError> {
        self.shared.signal.wait(timeout)
    }

    /// Shared handle on the completion signal.
    pub fn completion(&self) -> CompletionSignal {
        self.shared.signal.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        match self.shared.signal.state() {
            CompletionState::Running if self.shared.is_cancel_requested() => {
                SubscriptionState::Cancelling
            }
            CompletionState::Running => SubscriptionState::Active,
            CompletionState::Cancelled => SubscriptionState::Cancelled,
            CompletionState::Succeeded | CompletionState::Failed(_) => SubscriptionState::Settled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancel_requested()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats.snapshot()
    }

    pub fn flow_controller(&self) -> &FlowController {
        &self.shared.flow
    }

    /// Blocks until the intake and every worker thread have exited.
    ///
    /// Threads only exit after the subscription settles, so call `cancel`
    /// first unless the source is expected to drain. Called from one of the
    /// subscription's own threads (a callback, say) it returns immediately
    /// and leaves the threads for a later `join` or the handle's `Drop`.
    pub fn join(&self) {
        let mut guard = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        let current = thread::current().id();
        if guard.iter().any(|handle| handle.thread().id() == current) {
            warn!("subscription joined from one of its own threads; not waiting");
            return;
        }
        let threads = std::mem::take(&mut *guard);
        drop(guard);
        for handle in threads {
            if handle.join().is_err() {
                warn!("subscriber thread panicked");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
        self.join();
    }
}
