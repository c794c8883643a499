use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tern_core::hash::derive_message_id;
use tern_core::{Attributes, MessageId, ReceivedMessage, SourceError};
use tracing::debug;

use crate::source::{MessageSource, SourceHealthSnapshot};

#[derive(Debug, Default)]
struct BrokerState {
    next_seq: u64,
    ready: VecDeque<ReceivedMessage>,
    outstanding: HashMap<MessageId, ReceivedMessage>,
    published: u64,
    acked: u64,
    redelivered: u64,
    pauses: u64,
    closed: bool,
}

/// Single-subscription in-memory broker for tests and simulations.
///
/// Clones share the same queue. Nacked messages, and messages still
/// outstanding when a source is cancelled, are requeued at the front with
/// their delivery attempt bumped (at-least-once).
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes one message and returns its broker-assigned id.
    pub fn publish(
        &self,
        payload: impl Into<Bytes>,
        attributes: Attributes,
    ) -> Result<MessageId, SourceError> {
        let payload = payload.into();
        let mut state = self.lock();
        if state.closed {
            return Err(SourceError::Closed);
        }
        state.next_seq += 1;
        let id = derive_message_id(state.next_seq, &payload);
        state.ready.push_back(ReceivedMessage {
            id: id.clone(),
            payload,
            attributes,
            delivery_attempt: 1,
        });
        state.published += 1;
        Ok(id)
    }

    /// Publishes a batch atomically with respect to other publishers.
    pub fn publish_batch<I>(&self, batch: I) -> Result<Vec<MessageId>, SourceError>
    where
        I: IntoIterator<Item = (Bytes, Attributes)>,
    {
        let mut state = self.lock();
        if state.closed {
            return Err(SourceError::Closed);
        }
        let mut ids = Vec::new();
        for (payload, attributes) in batch {
            state.next_seq += 1;
            let id = derive_message_id(state.next_seq, &payload);
            state.ready.push_back(ReceivedMessage {
                id: id.clone(),
                payload,
                attributes,
                delivery_attempt: 1,
            });
            state.published += 1;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Ends the stream once everything already published is settled.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn outstanding_len(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn acked_count(&self) -> u64 {
        self.lock().acked
    }

    pub fn redelivered_count(&self) -> u64 {
        self.lock().redelivered
    }

    /// Number of times a source asked the broker to pause delivery.
    pub fn pause_count(&self) -> u64 {
        self.lock().pauses
    }

    /// Opens a pull stream against this broker.
    pub fn source(&self) -> InMemorySource {
        InMemorySource {
            broker: self.clone(),
            paused: false,
            cancelled: false,
            fail_next_recv: None,
            health: SourceHealthSnapshot::default(),
        }
    }
}

fn requeue(state: &mut BrokerState, mut msg: ReceivedMessage) {
    msg.delivery_attempt += 1;
    state.redelivered += 1;
    state.ready.push_front(msg);
}

/// Pull stream over an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemorySource {
    broker: InMemoryBroker,
    paused: bool,
    cancelled: bool,
    fail_next_recv: Option<SourceError>,
    health: SourceHealthSnapshot,
}

impl InMemorySource {
    /// Makes the next `recv` fail with `err` (transport failure simulation).
    pub fn fail_next_recv(&mut self, err: SourceError) {
        self.fail_next_recv = Some(err);
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn record_error(&mut self, err: &SourceError) {
        self.health.ack_errors += 1;
        self.health.last_error = Some(err.to_string());
    }
}

impl MessageSource for InMemorySource {
    fn recv(&mut self) -> Result<Option<ReceivedMessage>, SourceError> {
        if self.cancelled {
            return Err(SourceError::Closed);
        }
        if let Some(err) = self.fail_next_recv.take() {
            self.health.last_error = Some(err.to_string());
            return Err(err);
        }
        if self.paused {
            return Ok(None);
        }
        let mut state = self.broker.lock();
        let Some(msg) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.outstanding.insert(msg.id.clone(), msg.clone());
        drop(state);
        self.health.received += 1;
        Ok(Some(msg))
    }

    fn ack(&mut self, id: &MessageId) -> Result<(), SourceError> {
        let mut state = self.broker.lock();
        if state.outstanding.remove(id).is_none() {
            drop(state);
            let err = SourceError::UnknownMessage(id.clone());
            self.record_error(&err);
            return Err(err);
        }
        state.acked += 1;
        drop(state);
        self.health.acked += 1;
        Ok(())
    }

    fn nack(&mut self, id: &MessageId) -> Result<(), SourceError> {
        let mut state = self.broker.lock();
        let Some(msg) = state.outstanding.remove(id) else {
            drop(state);
            let err = SourceError::UnknownMessage(id.clone());
            self.record_error(&err);
            return Err(err);
        };
        requeue(&mut state, msg);
        drop(state);
        self.health.nacked += 1;
        Ok(())
    }

    fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.health.paused = true;
            self.broker.lock().pauses += 1;
        }
    }

    fn resume(&mut self) {
        self.paused = false;
        self.health.paused = false;
    }

    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let mut state = self.broker.lock();
        let outstanding: Vec<ReceivedMessage> =
            state.outstanding.drain().map(|(_, msg)| msg).collect();
        let returned = outstanding.len();
        for msg in outstanding {
            requeue(&mut state, msg);
        }
        debug!(returned, "in-memory source cancelled");
    }

    fn is_closed(&self) -> bool {
        let state = self.broker.lock();
        state.closed && state.ready.is_empty() && state.outstanding.is_empty()
    }

    fn health_snapshot(&self) -> SourceHealthSnapshot {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryBroker;
    use crate::source::MessageSource;
    use tern_core::{Attributes, MessageId, SourceError};

    fn attrs(num: usize) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("num".to_string(), num.to_string());
        attributes
    }

    #[test]
    fn publish_then_recv_then_ack_removes_message() {
        let broker = InMemoryBroker::new();
        let id = broker
            .publish(b"Wooooo! The claaaaaw!".to_vec(), attrs(0))
            .expect("publish should succeed");
        let mut source = broker.source();

        let msg = source
            .recv()
            .expect("recv should succeed")
            .expect("one message should be ready");
        assert_eq!(msg.id, id);
        assert_eq!(msg.attribute("num"), Some("0"));
        assert_eq!(broker.outstanding_len(), 1);

        source.ack(&id).expect("ack should succeed");
        assert_eq!(broker.outstanding_len(), 0);
        assert_eq!(broker.acked_count(), 1);
        assert!(source.recv().expect("recv should succeed").is_none());
    }

    #[test]
    fn nack_requeues_at_front_with_bumped_attempt() {
        let broker = InMemoryBroker::new();
        let first = broker.publish(b"a".to_vec(), attrs(1)).expect("publish");
        broker.publish(b"b".to_vec(), attrs(2)).expect("publish");
        let mut source = broker.source();

        let msg = source.recv().expect("recv").expect("message");
        assert_eq!(msg.id, first);
        source.nack(&first).expect("nack should succeed");

        let again = source.recv().expect("recv").expect("message");
        assert_eq!(again.id, first);
        assert_eq!(again.delivery_attempt, 2);
        assert_eq!(broker.redelivered_count(), 1);
    }

    #[test]
    fn ack_of_unknown_id_is_reported() {
        let broker = InMemoryBroker::new();
        let mut source = broker.source();
        let err = source
            .ack(&MessageId::from("nope"))
            .expect_err("unknown ack should fail");
        assert_eq!(err, SourceError::UnknownMessage(MessageId::from("nope")));
        assert_eq!(source.health_snapshot().ack_errors, 1);
    }

    #[test]
    fn paused_source_yields_nothing_until_resumed() {
        let broker = InMemoryBroker::new();
        broker.publish(b"x".to_vec(), Attributes::new()).expect("publish");
        let mut source = broker.source();

        source.pause();
        source.pause();
        assert!(source.is_paused());
        assert!(source.recv().expect("recv").is_none());
        assert_eq!(broker.pause_count(), 1);

        source.resume();
        assert!(source.recv().expect("recv").is_some());
    }

    #[test]
    fn cancel_returns_outstanding_messages_to_broker() {
        let broker = InMemoryBroker::new();
        broker.publish(b"x".to_vec(), Attributes::new()).expect("publish");
        let mut source = broker.source();
        assert!(source.recv().expect("recv").is_some());

        source.cancel();
        assert_eq!(broker.outstanding_len(), 0);
        assert_eq!(broker.ready_len(), 1);
        assert_eq!(source.recv(), Err(SourceError::Closed));
    }

    #[test]
    fn closed_only_after_everything_is_settled() {
        let broker = InMemoryBroker::new();
        let id = broker.publish(b"x".to_vec(), Attributes::new()).expect("publish");
        let mut source = broker.source();
        broker.close();
        assert!(!source.is_closed());

        assert!(source.recv().expect("recv").is_some());
        assert!(!source.is_closed());
        source.ack(&id).expect("ack");
        assert!(source.is_closed());
        assert_eq!(
            broker.publish(b"late".to_vec(), Attributes::new()),
            Err(SourceError::Closed)
        );
    }

    #[test]
    fn injected_failure_surfaces_once() {
        let broker = InMemoryBroker::new();
        let mut source = broker.source();
        source.fail_next_recv(SourceError::Unavailable("stream reset".into()));
        assert_eq!(
            source.recv(),
            Err(SourceError::Unavailable("stream reset".into()))
        );
        assert_eq!(source.recv(), Ok(None));
    }
}
