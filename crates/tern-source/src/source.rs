use tern_core::{MessageId, ReceivedMessage, SourceError};

/// Coarse per-source delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHealthSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub ack_errors: u64,
    pub paused: bool,
    pub last_error: Option<String>,
}

/// Pull/ack contract the subscriber drives against a remote broker.
///
/// Implementations own the wire protocol, retries and redelivery; the
/// subscriber only pulls records and reports their settlement.
pub trait MessageSource: Send + 'static {
    /// Returns the next ready message without blocking.
    ///
    /// `Ok(None)` means nothing is ready right now (or delivery is paused).
    fn recv(&mut self) -> Result<Option<ReceivedMessage>, SourceError>;

    /// Permanently removes `id` from broker redelivery.
    fn ack(&mut self, id: &MessageId) -> Result<(), SourceError>;

    /// Asks the broker to redeliver `id`.
    fn nack(&mut self, id: &MessageId) -> Result<(), SourceError>;

    /// Stops pushing new messages while the subscriber is at capacity.
    fn pause(&mut self) {}

    /// Resumes delivery after `pause`.
    fn resume(&mut self) {}

    /// Stops the stream. Unsettled messages go back to the broker.
    fn cancel(&mut self) {}

    /// Whether the stream has ended and no further messages will arrive.
    fn is_closed(&self) -> bool {
        false
    }

    fn health_snapshot(&self) -> SourceHealthSnapshot {
        SourceHealthSnapshot::default()
    }
}
