use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tern_core::SourceError;
use thiserror::Error;

/// Terminal and operational failures of a subscription.
///
/// `Clone` so every waiter on a completion signal observes the same error.
#[derive(Debug, Clone, Error)]
pub enum SubscriberError {
    /// Pending counters went out of range. Indicates a bug.
    #[error("flow control violation: {0}")]
    FlowControlViolation(String),
    /// The user callback returned an error or panicked.
    #[error("callback failed: {0}")]
    Callback(CallbackError),
    /// Settlement did not happen within the requested bound.
    #[error("timed out after {0:?} waiting for subscription result")]
    Timeout(Duration),
    /// The message source failed while pulling.
    #[error("message source failed: {0}")]
    Source(#[from] SourceError),
    #[error("invalid subscriber config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn subscriber thread: {0}")]
    Spawn(String),
}

impl SubscriberError {
    /// Returns the captured callback error, if this is a callback failure.
    pub fn as_callback(&self) -> Option<&CallbackError> {
        match self {
            SubscriberError::Callback(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SubscriberError::Timeout(_))
    }
}

impl From<CallbackError> for SubscriberError {
    fn from(err: CallbackError) -> Self {
        SubscriberError::Callback(err)
    }
}

/// Error raised by a user callback.
///
/// Wraps any `Error + Send + Sync` behind an `Arc`; the original type can be
/// recovered with [`CallbackError::downcast_ref`]. Any such error converts
/// with `?`.
#[derive(Clone)]
pub struct CallbackError {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

impl CallbackError {
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Builds an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(CallbackMessage(message.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(CallbackPanic(message))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Error + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    pub fn is<E>(&self) -> bool
    where
        E: Error + 'static,
    {
        self.inner.is::<E>()
    }

    pub fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl<E> From<E> for CallbackError
where
    E: Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct CallbackMessage(String);

/// A callback panicked; carries the panic message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("callback panicked: {0}")]
pub struct CallbackPanic(pub String);
