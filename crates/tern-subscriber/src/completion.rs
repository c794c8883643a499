use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::SubscriberError;

/// Settlement state of a [`CompletionSignal`]. Leaves `Running` at most once.
#[derive(Debug, Clone)]
pub enum CompletionState {
    Running,
    Succeeded,
    Failed(SubscriberError),
    Cancelled,
}

impl CompletionState {
    pub fn is_running(&self) -> bool {
        matches!(self, CompletionState::Running)
    }
}

/// Non-error terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Cancelled,
}

#[derive(Debug)]
struct SignalInner {
    state: Mutex<CompletionState>,
    settled: Condvar,
}

/// Single-assignment settlement shared by workers and waiters.
///
/// Clones observe the same state. The first of `succeed`, `fail` or
/// `settle_cancelled` wins; later calls return `false`.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(CompletionState::Running),
                settled: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, next: CompletionState) -> bool {
        let mut state = self.lock();
        if !state.is_running() {
            return false;
        }
        *state = next;
        drop(state);
        self.inner.settled.notify_all();
        true
    }

    pub fn succeed(&self) -> bool {
        self.settle(CompletionState::Succeeded)
    }

    pub fn fail(&self, err: SubscriberError) -> bool {
        self.settle(CompletionState::Failed(err))
    }

    pub fn settle_cancelled(&self) -> bool {
        self.settle(CompletionState::Cancelled)
    }

    pub fn is_settled(&self) -> bool {
        !self.lock().is_running()
    }

    pub fn state(&self) -> CompletionState {
        self.lock().clone()
    }

    /// Blocks until settled or until `timeout` elapses (`None` waits forever).
    ///
    /// Returns the success outcome, the settled error, or
    /// [`SubscriberError::Timeout`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Completion, SubscriberError> {
        let state = self.lock();
        let state = match timeout {
            None => self
                .inner
                .settled
                .wait_while(state, |state| state.is_running())
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (state, _) = self
                    .inner
                    .settled
                    .wait_timeout_while(state, timeout, |state| state.is_running())
                    .unwrap_or_else(PoisonError::into_inner);
                if state.is_running() {
                    return Err(SubscriberError::Timeout(timeout));
                }
                state
            }
        };
        match &*state {
            CompletionState::Succeeded => Ok(Completion::Succeeded),
            CompletionState::Cancelled => Ok(Completion::Cancelled),
            CompletionState::Failed(err) => Err(err.clone()),
            CompletionState::Running => unreachable!("wait returned while running"),
        }
    }
}
