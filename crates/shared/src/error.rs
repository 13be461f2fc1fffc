use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of everything that can go wrong between a push arriving and
/// a message being displayed. Carried in notification outcomes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidPayload,
    InvalidEncoding,
    StaleContext,
    CryptoFailure,
    Timeout,
    Storage,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidEncoding => "invalid_encoding",
            Self::StaleContext => "stale_context",
            Self::CryptoFailure => "crypto_failure",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
