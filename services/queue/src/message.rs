//! Queue envelope shared by every backend.

use crate::QueueError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work on the queue: an id plus an opaque payload.
///
/// On the Kafka wire the envelope is JSON with `content` base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(with = "base64_content")]
    pub content: Bytes,
}

impl Message {
    /// Wrap a payload in a fresh envelope with a random id.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }

    pub fn with_id(id: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    /// Serialize `value` as JSON into a new envelope.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, QueueError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self::new(payload))
    }

    /// Deserialize the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_slice(&self.content).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_wire(payload: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

mod base64_content {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_encodes_content_as_base64() {
        let message = Message::with_id("job-1", &b"Hello World"[..]);
        let wire = message.to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();

        assert_eq!(value["id"], "job-1");
        assert_eq!(value["content"], "SGVsbG8gV29ybGQ=");
        assert_eq!(Message::from_wire(&wire).unwrap(), message);
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert!(matches!(
            Message::from_wire(b"not json"),
            Err(QueueError::Serialization(_))
        ));
    }

    #[test]
    fn test_json_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Job {
            song_id: String,
        }

        let message = Message::json(&Job {
            song_id: "abc".to_string(),
        })
        .unwrap();
        assert!(!message.id.is_empty());

        let job: Job = message.decode_json().unwrap();
        assert_eq!(job.song_id, "abc");
    }
}
