use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// String key/value metadata published alongside a payload.
pub type Attributes = BTreeMap<String, String>;

/// Immutable message record as yielded by a message source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub payload: Bytes,
    pub attributes: Attributes,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    pub fn new(id: impl Into<MessageId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            attributes: Attributes::new(),
            delivery_attempt: 1,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Payload size counted against flow-control byte ceilings.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageId, ReceivedMessage};

    #[test]
    fn size_counts_payload_bytes_only() {
        let msg = ReceivedMessage::new("m-1", b"hello".to_vec()).with_attribute("num", "7");
        assert_eq!(msg.size(), 5);
        assert_eq!(msg.attribute("num"), Some("7"));
        assert_eq!(msg.attribute("missing"), None);
        assert_eq!(msg.delivery_attempt, 1);
    }

    #[test]
    fn message_id_displays_inner_string() {
        let id = MessageId::from("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
    }
}
