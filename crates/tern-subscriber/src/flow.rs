use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tern_core::ReceivedMessage;
use tracing::error;

use crate::config::FlowControlConfig;
use crate::error::SubscriberError;

#[derive(Debug, Default)]
struct FlowState {
    messages: usize,
    bytes: usize,
    peak_messages: usize,
    peak_bytes: usize,
}

/// Gates admission of messages against the pending-set ceilings.
///
/// One mutex guards the `(messages, bytes)` pair so every check-and-update
/// is atomic with respect to concurrent releases. A message larger than
/// `max_bytes` on its own is admitted only into an empty pending set.
#[derive(Debug)]
pub struct FlowController {
    config: FlowControlConfig,
    state: Mutex<FlowState>,
    released: Condvar,
}

impl FlowController {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FlowState::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> FlowControlConfig {
        self.config
    }

    fn fits(&self, state: &FlowState, size: usize) -> bool {
        if state.messages >= self.config.max_messages {
            return false;
        }
        match self.config.max_bytes {
            Some(max_bytes) => state.messages == 0 || state.bytes.saturating_add(size) <= max_bytes,
            None => true,
        }
    }

    /// Admits `message` into the pending set if it fits under both ceilings.
    pub fn admit(&self, message: &ReceivedMessage) -> bool {
        let size = message.size();
        let mut state = self.lock();
        if !self.fits(&state, size) {
            return false;
        }
        state.messages += 1;
        state.bytes += size;
        state.peak_messages = state.peak_messages.max(state.messages);
        state.peak_bytes = state.peak_bytes.max(state.bytes);
        true
    }

    /// Returns one message of `size` bytes' worth of capacity.
    pub fn release(&self, size: usize) -> Result<(), SubscriberError> {
        let mut state = self.lock();
        if state.messages == 0 || state.bytes < size {
            let detail = format!(
                "release of {size} bytes with {} pending messages / {} pending bytes",
                state.messages, state.bytes
            );
            error!(pending = state.messages, pending_bytes = state.bytes, size, "flow control underflow");
            return Err(SubscriberError::FlowControlViolation(detail));
        }
        state.messages -= 1;
        state.bytes -= size;
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    /// Blocks until a message of `size` bytes would be admitted, or `timeout`
    /// elapses. Returns whether capacity is available.
    pub fn wait_for_capacity(&self, size: usize, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .released
            .wait_timeout_while(state, timeout, |state| !self.fits(state, size))
            .unwrap_or_else(PoisonError::into_inner);
        self.fits(&state, size)
    }

    pub fn pending(&self) -> usize {
        self.lock().messages
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Highest pending message count observed so far.
    pub fn peak_pending(&self) -> usize {
        self.lock().peak_messages
    }

    pub fn peak_pending_bytes(&self) -> usize {
        self.lock().peak_bytes
    }
}
