use serde::{Deserialize, Serialize};

/// Message is the envelope relayed by the hub. Every frame on the wire is a
/// single JSON object with exactly the fields `type`, `data` and `sender_id`.
///
/// The hub never looks inside `type` or `data`. Missing fields decode as empty
/// strings and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(rename = "type")]
    kind: String,
    data: String,
    sender_id: String,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
            sender_id: String::new(),
        }
    }

    /// A message originated by the server itself rather than a client.
    pub fn system(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(kind, data)
    }

    /// Re-stamp the sender. Whatever the client put in `sender_id` is replaced.
    pub fn with_sender(self, sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            ..self
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn is_system(&self) -> bool {
        self.sender_id.is_empty()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn decode_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
