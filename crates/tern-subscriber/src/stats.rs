use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time subscriber counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    /// Messages pulled from the source.
    pub received: u64,
    /// Messages handed to a worker for callback invocation.
    pub dispatched: u64,
    /// Callback invocations that returned `Ok`.
    pub completed_calls: u64,
    /// Callback invocations that returned an error or panicked.
    pub callback_errors: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Admission attempts deferred by flow control.
    pub held_back: u64,
    /// Ack/nack forwards the source rejected.
    pub source_ack_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriberStatsInner {
    pub(crate) received: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) completed_calls: AtomicU64,
    pub(crate) callback_errors: AtomicU64,
    pub(crate) acked: AtomicU64,
    pub(crate) nacked: AtomicU64,
    pub(crate) held_back: AtomicU64,
    pub(crate) source_ack_errors: AtomicU64,
}

impl SubscriberStatsInner {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed_calls: self.completed_calls.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            held_back: self.held_back.load(Ordering::Relaxed),
            source_ack_errors: self.source_ack_errors.load(Ordering::Relaxed),
        }
    }
}
