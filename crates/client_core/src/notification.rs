use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::FailureKind,
    protocol::{PushPayload, MLS_MESSAGE_PUSH_TYPE},
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    config::EngineSettings,
    error::PayloadError,
    gateway::{DecryptRequest, DecryptionGateway},
};

pub const ATTACHMENT_BODY: &str = "Sent an attachment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub decrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    Show(NotificationContent),
    /// The push was for a message the recipient sent themselves.
    Suppress,
}

/// Where the host hands finished notifications to the OS.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, delivery: Delivery);
}

/// A push payload with every required field present and non-blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPush {
    pub ciphertext: String,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub recipient: UserId,
    pub sender: Option<UserId>,
}

pub fn validate_payload(payload: &PushPayload) -> Result<ValidatedPush, PayloadError> {
    if let Some(kind) = non_blank(&payload.kind) {
        if kind != MLS_MESSAGE_PUSH_TYPE {
            return Err(PayloadError::UnsupportedType(kind.to_string()));
        }
    }
    let ciphertext = non_blank(&payload.ciphertext).ok_or(PayloadError::MissingField("ciphertext"))?;
    let convo_id = non_blank(&payload.convo_id).ok_or(PayloadError::MissingField("convo_id"))?;
    let message_id =
        non_blank(&payload.message_id).ok_or(PayloadError::MissingField("message_id"))?;
    let recipient =
        non_blank(&payload.recipient_did).ok_or(PayloadError::MissingField("recipient_did"))?;

    Ok(ValidatedPush {
        ciphertext: ciphertext.to_string(),
        conversation_id: ConversationId::from(convo_id),
        message_id: MessageId::from(message_id),
        recipient: UserId::from(recipient),
        sender: non_blank(&payload.sender_did).map(UserId::from),
    })
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Conversation ids are hex-encoded group ids; anything else is used as the
/// group id bytes verbatim.
pub fn decode_group_id(conversation_id: &ConversationId) -> Vec<u8> {
    let raw = conversation_id.as_str();
    hex::decode(raw).unwrap_or_else(|_| raw.as_bytes().to_vec())
}

/// State of one extension invocation. Exactly one delivery reaches the sink,
/// whichever of the pipeline and the expiry callback gets there first.
pub struct NotificationInvocation {
    delivered: AtomicBool,
    partial: Mutex<Option<NotificationContent>>,
    fallback: NotificationContent,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationInvocation {
    fn new(fallback: NotificationContent, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            delivered: AtomicBool::new(false),
            partial: Mutex::new(None),
            fallback,
            sink,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Called by the host when its time budget runs out. Delivers the best
    /// partial result gathered so far, or the generic fallback. Returns `None`
    /// when the invocation had already delivered.
    pub fn expire(&self) -> Option<Delivery> {
        let delivery = Delivery::Show(self.best_partial());
        if !self.deliver(delivery.clone()) {
            return None;
        }
        warn!("notification: deadline reached, delivered best partial result");
        Some(delivery)
    }

    fn best_partial(&self) -> NotificationContent {
        let partial = self
            .partial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        with_failure(
            partial.unwrap_or_else(|| self.fallback.clone()),
            FailureKind::Timeout,
        )
    }

    fn record_partial(&self, content: NotificationContent) {
        *self
            .partial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(content);
    }

    fn deliver(&self, delivery: Delivery) -> bool {
        if self.delivered.swap(true, Ordering::SeqCst) {
            debug!("notification: dropping late delivery");
            return false;
        }
        self.sink.deliver(delivery);
        true
    }
}

pub struct NotificationPipeline {
    gateway: Arc<dyn DecryptionGateway>,
    fallback_title: String,
    fallback_body: String,
    deadline: Duration,
}

impl NotificationPipeline {
    pub fn new(gateway: Arc<dyn DecryptionGateway>, settings: &EngineSettings) -> Self {
        Self {
            gateway,
            fallback_title: settings.fallback_title.clone(),
            fallback_body: settings.fallback_body.clone(),
            deadline: settings.notification_deadline(),
        }
    }

    pub fn begin(&self, sink: Arc<dyn NotificationSink>) -> Arc<NotificationInvocation> {
        Arc::new(NotificationInvocation::new(
            self.fallback_content(None, None),
            sink,
        ))
    }

    /// Resolves `raw` and delivers through `invocation` unless the expiry
    /// callback already did. Returns what this run produced.
    pub async fn process(&self, invocation: &NotificationInvocation, raw: &[u8]) -> Delivery {
        let delivery = self.resolve(invocation, raw).await;
        invocation.deliver(delivery.clone());
        delivery
    }

    /// Runs one invocation under the configured deadline.
    pub async fn run(&self, raw: &[u8], sink: Arc<dyn NotificationSink>) -> Delivery {
        let invocation = self.begin(sink);
        match timeout(self.deadline, self.process(&invocation, raw)).await {
            Ok(delivery) => delivery,
            Err(_) => invocation
                .expire()
                .unwrap_or_else(|| Delivery::Show(invocation.best_partial())),
        }
    }

    async fn resolve(&self, invocation: &NotificationInvocation, raw: &[u8]) -> Delivery {
        let payload: PushPayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("notification: {}", PayloadError::Malformed(e.to_string()));
                return Delivery::Show(with_failure(
                    self.fallback_content(None, None),
                    FailureKind::InvalidPayload,
                ));
            }
        };
        let push = match validate_payload(&payload) {
            Ok(push) => push,
            Err(e) => {
                warn!("notification: {e}");
                let convo = non_blank(&payload.convo_id).map(ConversationId::from);
                return Delivery::Show(with_failure(
                    self.fallback_content(convo.as_ref(), None),
                    FailureKind::InvalidPayload,
                ));
            }
        };

        if let Some(sender) = &push.sender {
            if sender.same_identity(&push.recipient) {
                info!(
                    "notification: suppressing self-sent message_id={}",
                    push.message_id
                );
                return Delivery::Suppress;
            }
        }

        let partial = self.fallback_content(Some(&push.conversation_id), Some(&push));
        invocation.record_partial(partial.clone());

        if let Some(text) = self
            .gateway
            .cached_plaintext(&push.message_id, &push.recipient)
            .await
        {
            debug!("notification: cache hit message_id={}", push.message_id);
            return Delivery::Show(self.decrypted_content(&push, text).await);
        }

        if let Err(e) = self.gateway.ensure_context(&push.recipient).await {
            warn!("notification: context unavailable: {e}");
            return Delivery::Show(with_failure(partial, FailureKind::StaleContext));
        }

        let ciphertext = match STANDARD.decode(push.ciphertext.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "notification: ciphertext is not base64 message_id={}: {e}",
                    push.message_id
                );
                return Delivery::Show(with_failure(partial, FailureKind::InvalidEncoding));
            }
        };

        let request = DecryptRequest {
            user_id: push.recipient.clone(),
            conversation_id: push.conversation_id.clone(),
            group_id: decode_group_id(&push.conversation_id),
            ciphertext,
            message_id: push.message_id.clone(),
        };
        match self.gateway.decrypt_and_store(request).await {
            Ok(text) => Delivery::Show(self.decrypted_content(&push, text).await),
            Err(e) => {
                warn!(
                    "notification: falling back for message_id={} kind={}",
                    push.message_id,
                    e.kind()
                );
                Delivery::Show(with_failure(partial, e.kind()))
            }
        }
    }

    async fn decrypted_content(&self, push: &ValidatedPush, text: String) -> NotificationContent {
        let body = if !text.trim().is_empty() {
            text
        } else {
            let has_embed = self
                .gateway
                .cached_message(&push.message_id, &push.recipient)
                .await
                .is_some_and(|cached| cached.embed.is_some());
            if has_embed {
                ATTACHMENT_BODY.to_string()
            } else {
                self.fallback_body.clone()
            }
        };
        NotificationContent {
            title: self.title_for(push.sender.as_ref()),
            body,
            thread_id: Some(push.conversation_id.to_string()),
            message_id: Some(push.message_id.to_string()),
            decrypted: true,
            failure: None,
        }
    }

    fn fallback_content(
        &self,
        convo: Option<&ConversationId>,
        push: Option<&ValidatedPush>,
    ) -> NotificationContent {
        NotificationContent {
            title: self.title_for(push.and_then(|p| p.sender.as_ref())),
            body: self.fallback_body.clone(),
            thread_id: convo.map(ToString::to_string),
            message_id: push.map(|p| p.message_id.to_string()),
            decrypted: false,
            failure: None,
        }
    }

    fn title_for(&self, sender: Option<&UserId>) -> String {
        sender
            .map(|s| s.as_str().trim().to_string())
            .unwrap_or_else(|| self.fallback_title.clone())
    }
}

fn with_failure(mut content: NotificationContent, failure: FailureKind) -> NotificationContent {
    content.failure = Some(failure);
    content
}

#[cfg(test)]
#[path = "tests/notification_tests.rs"]
mod tests;
