use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tern_core::{Attributes, MessageId, ReceivedMessage};
use tracing::{debug, error, warn};

use crate::dispatch::IntakeEvent;
use crate::flow::FlowController;
use crate::stats::SubscriberStatsInner;

/// Settlement state of one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked,
}

/// Records settlements, releases flow-control capacity and forwards the
/// outcome to the intake thread (which owns the source).
pub(crate) struct AckTracker {
    flow: Arc<FlowController>,
    events: mpsc::Sender<IntakeEvent>,
    stats: Arc<SubscriberStatsInner>,
}

impl AckTracker {
    pub(crate) fn new(
        flow: Arc<FlowController>,
        events: mpsc::Sender<IntakeEvent>,
        stats: Arc<SubscriberStatsInner>,
    ) -> Self {
        Self {
            flow,
            events,
            stats,
        }
    }

    /// Wraps an admitted record into a pending [`Message`].
    pub(crate) fn lease(self: &Arc<Self>, record: ReceivedMessage) -> Message {
        let lease = Arc::new(Lease {
            id: record.id.clone(),
            size: record.size(),
            state: Mutex::new(AckState::Pending),
            tracker: Arc::clone(self),
        });
        Message { record, lease }
    }

    fn settled(&self, id: &MessageId, size: usize, outcome: AckState) {
        match outcome {
            AckState::Acked => SubscriberStatsInner::bump(&self.stats.acked),
            AckState::Nacked => SubscriberStatsInner::bump(&self.stats.nacked),
            AckState::Pending => return,
        }
        // Forward before releasing: the intake treats zero pending as
        // "every settlement is already queued".
        let event = IntakeEvent::Settled {
            id: id.clone(),
            outcome,
        };
        if self.events.send(event).is_err() {
            debug!(message_id = %id, "intake stopped; settlement not forwarded");
        }
        if let Err(err) = self.flow.release(size) {
            error!(message_id = %id, error = %err, "flow release failed");
        }
    }
}

/// Per-message guard; the first transition away from `Pending` wins.
pub(crate) struct Lease {
    id: MessageId,
    size: usize,
    state: Mutex<AckState>,
    tracker: Arc<AckTracker>,
}

impl Lease {
    pub(crate) fn settle(&self, outcome: AckState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != AckState::Pending {
            return false;
        }
        *state = outcome;
        self.tracker.settled(&self.id, self.size, outcome);
        true
    }

    pub(crate) fn state(&self) -> AckState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A delivered message handed to the subscriber callback.
///
/// Payload and attributes are immutable. Exactly one of [`Message::ack`] or
/// [`Message::nack`] takes effect; later calls are no-ops. A message dropped
/// while still pending is nacked so its capacity is never leaked.
pub struct Message {
    record: ReceivedMessage,
    lease: Arc<Lease>,
}

impl Message {
    pub fn id(&self) -> &MessageId {
        &self.record.id
    }

    pub fn data(&self) -> &Bytes {
        &self.record.payload
    }

    pub fn attributes(&self) -> &Attributes {
        &self.record.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.record.attribute(key)
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.record.delivery_attempt
    }

    pub fn size(&self) -> usize {
        self.record.size()
    }

    pub fn ack_state(&self) -> AckState {
        self.lease.state()
    }

    /// Acknowledges the message. Returns `true` if this call settled it.
    pub fn ack(&self) -> bool {
        self.lease.settle(AckState::Acked)
    }

    /// Requests redelivery. Returns `true` if this call settled it.
    pub fn nack(&self) -> bool {
        self.lease.settle(AckState::Nacked)
    }

    pub(crate) fn lease(&self) -> Arc<Lease> {
        Arc::clone(&self.lease)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.lease.settle(AckState::Nacked) {
            warn!(message_id = %self.record.id, "message dropped while pending; nacked");
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.record.id)
            .field("size", &self.record.size())
            .field("attributes", &self.record.attributes)
            .field("delivery_attempt", &self.record.delivery_attempt)
            .field("ack_state", &self.ack_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AckState, AckTracker};
    use crate::config::FlowControlConfig;
    use crate::dispatch::IntakeEvent;
    use crate::flow::FlowController;
    use crate::stats::SubscriberStatsInner;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use tern_core::ReceivedMessage;

    struct Fixture {
        flow: Arc<FlowController>,
        tracker: Arc<AckTracker>,
        stats: Arc<SubscriberStatsInner>,
        events: mpsc::Receiver<IntakeEvent>,
    }

    fn fixture() -> Fixture {
        let flow = Arc::new(FlowController::new(FlowControlConfig::with_max_messages(4)));
        let stats = Arc::new(SubscriberStatsInner::default());
        let (tx, events) = mpsc::channel();
        let tracker = Arc::new(AckTracker::new(Arc::clone(&flow), tx, Arc::clone(&stats)));
        Fixture {
            flow,
            tracker,
            stats,
            events,
        }
    }

    fn admitted(fx: &Fixture, id: &str) -> super::Message {
        let record = ReceivedMessage::new(id, b"payload".to_vec()).with_attribute("num", "1");
        assert!(fx.flow.admit(&record));
        fx.tracker.lease(record)
    }

    #[test]
    fn second_ack_is_a_silent_no_op() {
        let fx = fixture();
        let msg = admitted(&fx, "m-1");
        assert_eq!(fx.flow.pending(), 1);

        assert!(msg.ack());
        assert!(!msg.ack());
        assert!(!msg.nack());
        assert_eq!(msg.ack_state(), AckState::Acked);
        assert_eq!(fx.flow.pending(), 0);

        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.nacked, 0);
        let forwarded: Vec<IntakeEvent> = fx.events.try_iter().collect();
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn nack_releases_capacity_once() {
        let fx = fixture();
        let msg = admitted(&fx, "m-2");
        assert!(msg.nack());
        assert!(!msg.nack());
        assert_eq!(fx.flow.pending(), 0);
        assert_eq!(fx.stats.snapshot().nacked, 1);
        match fx.events.try_recv().expect("one settlement forwarded") {
            IntakeEvent::Settled { id, outcome } => {
                assert_eq!(id.as_str(), "m-2");
                assert_eq!(outcome, AckState::Nacked);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dropping_a_pending_message_nacks_it() {
        let fx = fixture();
        let msg = admitted(&fx, "m-3");
        let lease = msg.lease();
        drop(msg);
        assert_eq!(lease.state(), AckState::Nacked);
        assert_eq!(fx.flow.pending(), 0);
    }

    #[test]
    fn dropping_an_acked_message_changes_nothing() {
        let fx = fixture();
        let msg = admitted(&fx, "m-4");
        msg.ack();
        drop(msg);
        assert_eq!(fx.stats.snapshot().nacked, 0);
        assert_eq!(fx.events.try_iter().count(), 1);
    }

    #[test]
    fn racing_ack_and_nack_settle_exactly_once() {
        let fx = fixture();
        let msg = admitted(&fx, "m-5");
        let wins: usize = thread::scope(|scope| {
            let a = scope.spawn(|| usize::from(msg.ack()));
            let b = scope.spawn(|| usize::from(msg.nack()));
            a.join().expect("ack thread") + b.join().expect("nack thread")
        });
        assert_eq!(wins, 1);
        assert_eq!(fx.flow.pending(), 0);
        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.acked + snapshot.nacked, 1);
    }

    #[test]
    fn accessors_expose_the_record() {
        let fx = fixture();
        let msg = admitted(&fx, "m-6");
        assert_eq!(msg.id().as_str(), "m-6");
        assert_eq!(msg.data().as_ref(), b"payload");
        assert_eq!(msg.attribute("num"), Some("1"));
        assert_eq!(msg.attributes().len(), 1);
        assert_eq!(msg.delivery_attempt(), 1);
        assert_eq!(msg.size(), 7);
        assert_eq!(msg.ack_state(), AckState::Pending);
        msg.ack();
    }
}
