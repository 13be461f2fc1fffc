use serde::{Deserialize, Serialize};

pub const MLS_MESSAGE_PUSH_TYPE: &str = "mls_message";

/// Push payload as delivered to the notification extension. Every field is
/// optional at this layer; required-field validation happens in the pipeline so
/// that a malformed push still yields a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_did: Option<String>,
}

/// Application content carried inside an MLS application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<serde_json::Value>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embed: None,
        }
    }

    /// Bytes that are not a JSON body object are taken as the text itself.
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<MessageBody>(bytes) {
            Ok(body) => body,
            Err(_) => Self::text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
