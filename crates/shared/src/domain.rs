use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

impl UserId {
    /// Canonical form used for identity comparisons (DIDs are case-insensitive
    /// in practice and push payloads are not always trimmed).
    pub fn normalized(&self) -> String {
        self.0.trim().to_lowercase()
    }

    pub fn same_identity(&self, other: &UserId) -> bool {
        self.normalized() == other.normalized()
    }
}

/// Locally generated identifier for a message that has not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMessageKind {
    ConversationCreated,
    MemberJoined,
    MemberLeft,
    MemberRemoved,
    EpochRotated,
}

/// Decrypted content of one confirmed message as seen by one local user.
/// Written once per (message_id, user_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedPlaintext {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub epoch: u64,
    pub decrypted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Anything that stands for a person in the conversation UI: the signed-in
/// viewer, a member profile, or a bare identifier.
pub trait Participant {
    fn user_id(&self) -> &UserId;

    fn display_name(&self) -> Option<&str> {
        None
    }

    fn label(&self) -> String {
        self.display_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.user_id().to_string())
    }
}

impl Participant for UserId {
    fn user_id(&self) -> &UserId {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub user_id: UserId,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Participant for MemberProfile {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .or(Some(self.handle.as_str()))
    }
}

/// The account currently signed in on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: UserId,
    pub handle: String,
}

impl Participant for Viewer {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn display_name(&self) -> Option<&str> {
        Some(self.handle.as_str())
    }
}
