use chrono::Utc;
use shared::domain::{DecryptedPlaintext, UserId};
use tracing::warn;

use crate::{
    gateway::{DecryptRequest, DecryptionGateway},
    timeline::{ConfirmedContent, ConfirmedEntry, ConfirmedMessage},
};

/// Attaches content to confirmed messages before they are merged. Messages
/// are walked in `(epoch, seq)` order because the ratchet only moves forward;
/// a message that cannot be decrypted is marked instead of failing the
/// render.
pub async fn resolve_confirmed(
    gateway: &dyn DecryptionGateway,
    user_id: &UserId,
    group_id: &[u8],
    mut confirmed: Vec<ConfirmedMessage>,
) -> Vec<ConfirmedEntry> {
    confirmed.sort_by_key(|message| (message.epoch, message.seq));

    let mut entries = Vec::with_capacity(confirmed.len());
    for message in confirmed {
        let content = resolve_one(gateway, user_id, group_id, &message).await;
        entries.push(ConfirmedEntry { message, content });
    }
    entries
}

async fn resolve_one(
    gateway: &dyn DecryptionGateway,
    user_id: &UserId,
    group_id: &[u8],
    message: &ConfirmedMessage,
) -> ConfirmedContent {
    if let Some(cached) = gateway.cached_message(&message.server_id, user_id).await {
        return ConfirmedContent::Decrypted(cached);
    }
    if message.ciphertext.is_empty() {
        return ConfirmedContent::Pending;
    }

    let request = DecryptRequest {
        user_id: user_id.clone(),
        conversation_id: message.conversation_id.clone(),
        group_id: group_id.to_vec(),
        ciphertext: message.ciphertext.clone(),
        message_id: message.server_id.clone(),
    };
    match gateway.decrypt_and_store(request).await {
        Ok(text) => {
            let plaintext = match gateway.cached_message(&message.server_id, user_id).await {
                Some(cached) => cached,
                None => DecryptedPlaintext {
                    message_id: message.server_id.clone(),
                    user_id: user_id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    text,
                    embed: None,
                    sender_id: Some(message.sender_id.clone()),
                    epoch: message.epoch,
                    decrypted_at: Utc::now(),
                },
            };
            ConfirmedContent::Decrypted(plaintext)
        }
        Err(e) => {
            warn!(
                "resolver: message_id={} epoch={} seq={} undecryptable: {e}",
                message.server_id, message.epoch, message.seq
            );
            ConfirmedContent::Undecryptable(e.kind())
        }
    }
}
