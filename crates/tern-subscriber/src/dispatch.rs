use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tern_core::{MessageId, ReceivedMessage, SourceError};
use tern_source::MessageSource;
use tracing::{debug, error, info, warn};

use crate::ack::{AckState, AckTracker, Message};
use crate::completion::CompletionSignal;
use crate::error::{CallbackError, SubscriberError};
use crate::flow::FlowController;
use crate::stats::SubscriberStatsInner;

/// User processing hook invoked once per admitted message.
///
/// The callback owns the message and is responsible for acking or nacking
/// it; the dispatcher never auto-acks. Implemented for closures.
pub trait MessageCallback: Send + Sync + 'static {
    fn invoke(&self, message: Message) -> Result<(), CallbackError>;
}

impl<F> MessageCallback for F
where
    F: Fn(Message) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    fn invoke(&self, message: Message) -> Result<(), CallbackError> {
        self(message)
    }
}

/// Wake-ups for the intake thread.
#[derive(Debug)]
pub(crate) enum IntakeEvent {
    /// A message left `Pending`; forward the outcome to the source.
    Settled { id: MessageId, outcome: AckState },
    /// A worker finished (or skipped) one dispatched message.
    CallFinished,
    /// Cancellation was requested.
    Wake,
}

/// State shared between the handle, the intake thread and workers.
pub(crate) struct DispatchShared {
    pub(crate) signal: CompletionSignal,
    pub(crate) cancel_requested: AtomicBool,
    /// Messages sent to the pool whose worker has not finished yet.
    pub(crate) in_flight: AtomicUsize,
    pub(crate) events: mpsc::Sender<IntakeEvent>,
    pub(crate) stats: Arc<SubscriberStatsInner>,
    pub(crate) flow: Arc<FlowController>,
}

impl DispatchShared {
    pub(crate) fn request_cancel(&self) -> bool {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(IntakeEvent::Wake);
        true
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

pub(crate) type JobReceiver = Arc<Mutex<mpsc::Receiver<Message>>>;

/// Worker loop: takes admitted messages off the shared queue until the
/// intake drops its sender.
pub(crate) fn run_worker(
    jobs: JobReceiver,
    callback: Arc<dyn MessageCallback>,
    shared: Arc<DispatchShared>,
) {
    loop {
        let next = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(message) = next else {
            break;
        };
        if shared.is_cancel_requested() {
            message.nack();
        } else {
            invoke_callback(callback.as_ref(), message, &shared);
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = shared.events.send(IntakeEvent::CallFinished);
    }
}

fn invoke_callback(callback: &dyn MessageCallback, message: Message, shared: &DispatchShared) {
    let id = message.id().clone();
    let lease = message.lease();
    debug!(message_id = %id, attempt = message.delivery_attempt(), "invoking callback");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.invoke(message)))
        .unwrap_or_else(|payload| Err(CallbackError::from_panic(payload)));

    match outcome {
        Ok(()) => SubscriberStatsInner::bump(&shared.stats.completed_calls),
        Err(err) => {
            SubscriberStatsInner::bump(&shared.stats.callback_errors);
            lease.settle(AckState::Nacked);
            if shared.signal.fail(SubscriberError::Callback(err.clone())) {
                error!(message_id = %id, error = %err, "callback failed; cancelling subscription");
            } else {
                debug!(message_id = %id, error = %err, "callback failed after settlement");
            }
            shared.request_cancel();
        }
    }
}

/// Intake side of the dispatcher. Owns the source.
pub(crate) struct Intake<S: MessageSource> {
    pub(crate) source: S,
    pub(crate) tracker: Arc<AckTracker>,
    pub(crate) shared: Arc<DispatchShared>,
    pub(crate) events: mpsc::Receiver<IntakeEvent>,
    pub(crate) jobs: mpsc::Sender<Message>,
    pub(crate) poll_interval: Duration,
}

enum Exit {
    Drained,
    Cancelled,
    Failed,
}

impl<S: MessageSource> Intake<S> {
    pub(crate) fn run(self) {
        let Intake {
            mut source,
            tracker,
            shared,
            events,
            jobs,
            poll_interval,
        } = self;
        let mut backlog: VecDeque<ReceivedMessage> = VecDeque::new();
        let mut paused = false;

        let exit = loop {
            // Sampled before draining: every release is preceded by its
            // settlement event, so zero pending means none is missed below.
            let idle = shared.flow.pending() == 0 && backlog.is_empty();
            while let Ok(event) = events.try_recv() {
                forward(&mut source, &shared, event);
            }

            if shared.is_cancel_requested() {
                break if shared.signal.is_settled() {
                    Exit::Failed
                } else {
                    Exit::Cancelled
                };
            }
            if idle && source.is_closed() {
                break Exit::Drained;
            }

            let admitted = admit_ready(
                &mut source,
                &tracker,
                &shared,
                &jobs,
                &mut backlog,
                &mut paused,
            );
            if let Err(err) = admitted {
                error!(error = %err, "message source failed; cancelling subscription");
                shared.signal.fail(SubscriberError::Source(err));
                shared.request_cancel();
                continue;
            }

            // Held back at capacity: the next release wakes us directly.
            // Settlement events queued meanwhile are drained on the next pass.
            if let Some(front) = backlog.front() {
                shared.flow.wait_for_capacity(front.size(), poll_interval);
                continue;
            }
            match events.recv_timeout(poll_interval) {
                Ok(event) => forward(&mut source, &shared, event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Exit::Cancelled,
            }
        };

        // Never admitted, so no flow capacity to return.
        for record in backlog.drain(..) {
            if let Err(err) = source.nack(&record.id) {
                warn!(message_id = %record.id, error = %err, "nack of held-back message failed");
            }
        }
        drop(jobs);

        while shared.in_flight.load(Ordering::SeqCst) > 0 {
            match events.recv_timeout(poll_interval) {
                Ok(event) => forward(&mut source, &shared, event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            forward(&mut source, &shared, event);
        }
        source.cancel();
        let health = source.health_snapshot();
        debug!(
            received = health.received,
            acked = health.acked,
            nacked = health.nacked,
            ack_errors = health.ack_errors,
            last_error = ?health.last_error,
            "source stopped"
        );

        match exit {
            Exit::Drained => {
                shared.signal.succeed();
                info!("source drained; subscription succeeded");
            }
            Exit::Cancelled => {
                shared.signal.settle_cancelled();
                info!(pending = shared.flow.pending(), "subscription cancelled");
            }
            Exit::Failed => {
                shared.signal.settle_cancelled();
                info!("subscription stopped after failure");
            }
        }
    }
}

/// Admits held-back messages in arrival order, then pulls from the source
/// while capacity lasts. The source is paused at the first message that
/// does not fit and resumed once the backlog has drained.
fn admit_ready<S: MessageSource>(
    source: &mut S,
    tracker: &Arc<AckTracker>,
    shared: &DispatchShared,
    jobs: &mpsc::Sender<Message>,
    backlog: &mut VecDeque<ReceivedMessage>,
    paused: &mut bool,
) -> Result<(), SourceError> {
    loop {
        if shared.is_cancel_requested() {
            return Ok(());
        }
        if backlog.is_empty() {
            if *paused {
                source.resume();
                *paused = false;
            }
            match source.recv()? {
                Some(record) => {
                    SubscriberStatsInner::bump(&shared.stats.received);
                    backlog.push_back(record);
                }
                None => return Ok(()),
            }
        }
        let Some(front) = backlog.front() else {
            return Ok(());
        };
        if !shared.flow.admit(front) {
            SubscriberStatsInner::bump(&shared.stats.held_back);
            if !*paused {
                debug!(pending = shared.flow.pending(), "flow control at capacity; pausing source");
                source.pause();
                *paused = true;
            }
            return Ok(());
        }
        let Some(record) = backlog.pop_front() else {
            return Ok(());
        };
        dispatch(tracker.lease(record), shared, jobs);
    }
}

fn dispatch(message: Message, shared: &DispatchShared, jobs: &mpsc::Sender<Message>) {
    shared.in_flight.fetch_add(1, Ordering::SeqCst);
    SubscriberStatsInner::bump(&shared.stats.dispatched);
    if let Err(mpsc::SendError(message)) = jobs.send(message) {
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        warn!(message_id = %message.id(), "worker pool gone; nacking");
        message.nack();
    }
}

fn forward<S: MessageSource>(source: &mut S, shared: &DispatchShared, event: IntakeEvent) {
    let IntakeEvent::Settled { id, outcome } = event else {
        return;
    };
    let result = match outcome {
        AckState::Acked => source.ack(&id),
        AckState::Nacked => source.nack(&id),
        AckState::Pending => return,
    };
    if let Err(err) = result {
        SubscriberStatsInner::bump(&shared.stats.source_ack_errors);
        warn!(message_id = %id, ?outcome, error = %err, "source rejected settlement");
    }
}
