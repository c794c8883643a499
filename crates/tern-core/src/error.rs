use thiserror::Error;

use crate::types::MessageId;

/// Failures reported by a message source collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The stream was cancelled or the broker shut down.
    #[error("source is closed")]
    Closed,
    /// Transient broker or transport failure.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// Ack/nack for an id the source has no outstanding lease for.
    #[error("unknown message id: {0}")]
    UnknownMessage(MessageId),
}

#[cfg(test)]
mod tests {
    use super::SourceError;
    use crate::types::MessageId;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(SourceError::Closed.to_string(), "source is closed");
        assert_eq!(
            SourceError::Unavailable("stream reset".into()).to_string(),
            "source unavailable: stream reset"
        );
        assert_eq!(
            SourceError::UnknownMessage(MessageId::from("m-9")).to_string(),
            "unknown message id: m-9"
        );
    }
}
