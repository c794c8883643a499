use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SubscriberError;

/// Ceilings on unacknowledged messages admitted at once.
///
/// Both ceilings are enforced independently: a message is admitted only
/// when it fits under each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// Maximum number of pending (unsettled) messages.
    pub max_messages: usize,
    /// Maximum total payload bytes of pending messages.
    pub max_bytes: Option<usize>,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_messages: 1_000,
            max_bytes: Some(100 * 1024 * 1024),
        }
    }
}

impl FlowControlConfig {
    /// Only bounds message count.
    pub fn with_max_messages(max_messages: usize) -> Self {
        Self {
            max_messages,
            max_bytes: None,
        }
    }

    /// No effective ceiling.
    pub fn unlimited() -> Self {
        Self {
            max_messages: usize::MAX,
            max_bytes: None,
        }
    }

    pub fn validate(&self) -> Result<(), SubscriberError> {
        if self.max_messages == 0 {
            return Err(SubscriberError::InvalidConfig(
                "max_messages must be positive",
            ));
        }
        if self.max_bytes == Some(0) {
            return Err(SubscriberError::InvalidConfig("max_bytes must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub flow_control: FlowControlConfig,
    /// Number of callback worker threads.
    pub max_workers: usize,
    /// How long the intake thread sleeps when the source has nothing ready.
    pub poll_interval: Duration,
    /// Prefix for spawned thread names.
    pub thread_name: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            flow_control: FlowControlConfig::default(),
            max_workers: 10,
            poll_interval: Duration::from_millis(10),
            thread_name: "tern-subscriber".to_string(),
        }
    }
}

impl SubscriberConfig {
    pub fn with_flow_control(flow_control: FlowControlConfig) -> Self {
        Self {
            flow_control,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SubscriberError> {
        self.flow_control.validate()?;
        if self.max_workers == 0 {
            return Err(SubscriberError::InvalidConfig("max_workers must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(SubscriberError::InvalidConfig(
                "poll_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowControlConfig, SubscriberConfig};
    use crate::error::SubscriberError;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let cfg = SubscriberConfig::default();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.flow_control.max_messages, 1_000);
        assert_eq!(cfg.flow_control.max_bytes, Some(100 * 1024 * 1024));
        assert_eq!(cfg.max_workers, 10);
    }

    #[test]
    fn zero_ceilings_are_rejected() {
        let err = FlowControlConfig::with_max_messages(0)
            .validate()
            .expect_err("zero max_messages should be rejected");
        assert!(matches!(err, SubscriberError::InvalidConfig(_)));

        let err = FlowControlConfig {
            max_messages: 5,
            max_bytes: Some(0),
        }
        .validate()
        .expect_err("zero max_bytes should be rejected");
        assert!(matches!(err, SubscriberError::InvalidConfig(_)));
    }

    #[test]
    fn worker_and_poll_settings_are_checked() {
        let cfg = SubscriberConfig {
            max_workers: 0,
            ..SubscriberConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SubscriberConfig {
            poll_interval: Duration::ZERO,
            ..SubscriberConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn flow_control_serializes_with_optional_byte_ceiling() {
        let cfg = FlowControlConfig::with_max_messages(5);
        let raw = serde_json::to_string(&cfg).expect("serialize");
        assert_eq!(raw, r#"{"max_messages":5,"max_bytes":null}"#);
    }
}
