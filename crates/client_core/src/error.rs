use mls::MlsError;
use shared::{
    domain::{ClientId, MessageId},
    error::FailureKind,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("storage unavailable while building context: {0}")]
    Storage(anyhow::Error),
    #[error("cryptographic context could not be built: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("decryption failed: {0}")]
    CryptoFailure(String),
    #[error(transparent)]
    Context(#[from] ContextError),
    /// The ledger records this message as consumed but no plaintext was cached
    /// for it, so it cannot be decrypted again.
    #[error("message {message_id} was already processed without cached plaintext")]
    AlreadyProcessed { message_id: MessageId },
    #[error("timed out waiting for the database write lock")]
    Timeout,
    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
}

impl DecryptError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidEncoding(_) => FailureKind::InvalidEncoding,
            Self::CryptoFailure(_) | Self::AlreadyProcessed { .. } => FailureKind::CryptoFailure,
            Self::Context(_) => FailureKind::StaleContext,
            Self::Timeout => FailureKind::Timeout,
            Self::Storage(_) => FailureKind::Storage,
        }
    }
}

impl From<MlsError> for DecryptError {
    fn from(err: MlsError) -> Self {
        match err {
            MlsError::InvalidEncoding(reason) => Self::InvalidEncoding(reason),
            other => Self::CryptoFailure(other.to_string()),
        }
    }
}

/// Reasons a push payload is rejected before any decryption is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not valid json: {0}")]
    Malformed(String),
    #[error("unsupported push type '{0}'")]
    UnsupportedType(String),
    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("no pending message with client id {0}")]
    UnknownClientId(ClientId),
    #[error("message {0} has not failed and cannot be retried")]
    NotFailed(ClientId),
}
