use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{ClientId, ConversationId, UserId};
use tracing::debug;

use crate::{
    config::EngineSettings,
    error::TrackerError,
    timeline::{merge_with_window, ConfirmedEntry, DisplayMessage, SystemMessage},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SendState {
    Sending,
    Sent,
    Failed(String),
}

/// A locally composed message shown before the server confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticMessage {
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub sender_id: UserId,
    pub state: SendState,
    pub attempts: u32,
}

/// The parts of a confirmed, decrypted message that reconciliation compares.
#[derive(Debug, Clone, Copy)]
pub struct Confirmation<'a> {
    pub conversation_id: &'a ConversationId,
    pub sender_id: &'a UserId,
    pub text: &'a str,
    pub embed: Option<&'a serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl OptimisticMessage {
    pub fn is_failed(&self) -> bool {
        matches!(self.state, SendState::Failed(_))
    }

    /// Whether `confirmed` is the server's copy of this message. Failed sends
    /// never match; the user decides what happens to them.
    pub fn matches(&self, confirmed: &Confirmation<'_>, window: Duration) -> bool {
        !self.is_failed()
            && &self.conversation_id == confirmed.conversation_id
            && self.sender_id.same_identity(confirmed.sender_id)
            && self.text.trim() == confirmed.text.trim()
            && self.embed.as_ref() == confirmed.embed
            && (confirmed.created_at - self.created_at).abs() <= window
    }
}

pub struct OptimisticTracker {
    pending: Vec<OptimisticMessage>,
    window: Duration,
}

impl OptimisticTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Vec::new(),
            window,
        }
    }

    /// Tracker using the configured reconciliation window.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.reconcile_window())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Merged timeline for one conversation, matching pending sends against
    /// `confirmed` with this tracker's window.
    pub fn timeline(
        &self,
        conversation_id: &ConversationId,
        confirmed: &[ConfirmedEntry],
        system: &[SystemMessage],
    ) -> Vec<DisplayMessage> {
        merge_with_window(&self.pending(conversation_id), confirmed, system, self.window)
    }

    pub fn begin_send(
        &mut self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
        embed: Option<serde_json::Value>,
    ) -> ClientId {
        self.begin_send_at(conversation_id, sender_id, text, embed, Utc::now())
    }

    pub fn begin_send_at(
        &mut self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
        embed: Option<serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> ClientId {
        let client_id = ClientId::generate();
        debug!("optimistic: sending client_id={client_id} convo={conversation_id}");
        self.pending.push(OptimisticMessage {
            client_id,
            conversation_id,
            text: text.into(),
            embed,
            created_at,
            sender_id,
            state: SendState::Sending,
            attempts: 1,
        });
        client_id
    }

    pub fn mark_sent(&mut self, client_id: ClientId) -> Result<(), TrackerError> {
        self.entry_mut(client_id)?.state = SendState::Sent;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        client_id: ClientId,
        reason: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let reason = reason.into();
        debug!("optimistic: send failed client_id={client_id}: {reason}");
        self.entry_mut(client_id)?.state = SendState::Failed(reason);
        Ok(())
    }

    /// Puts a failed message back into `Sending` for another attempt.
    pub fn retry(&mut self, client_id: ClientId) -> Result<&OptimisticMessage, TrackerError> {
        let entry = self.entry_mut(client_id)?;
        if !entry.is_failed() {
            return Err(TrackerError::NotFailed(client_id));
        }
        entry.state = SendState::Sending;
        entry.attempts += 1;
        Ok(entry)
    }

    pub fn discard(&mut self, client_id: ClientId) -> Option<OptimisticMessage> {
        let index = self
            .pending
            .iter()
            .position(|entry| entry.client_id == client_id)?;
        Some(self.pending.remove(index))
    }

    /// Removes the earliest pending entry that `confirmed` stands for.
    pub fn reconcile(&mut self, confirmed: &Confirmation<'_>) -> Option<OptimisticMessage> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.matches(confirmed, self.window))
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(index, _)| index)?;
        let removed = self.pending.remove(index);
        debug!(
            "optimistic: reconciled client_id={} convo={}",
            removed.client_id, removed.conversation_id
        );
        Some(removed)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&OptimisticMessage> {
        self.pending.iter().find(|entry| entry.client_id == client_id)
    }

    pub fn pending(&self, conversation_id: &ConversationId) -> Vec<OptimisticMessage> {
        self.pending
            .iter()
            .filter(|entry| &entry.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn entry_mut(&mut self, client_id: ClientId) -> Result<&mut OptimisticMessage, TrackerError> {
        self.pending
            .iter_mut()
            .find(|entry| entry.client_id == client_id)
            .ok_or(TrackerError::UnknownClientId(client_id))
    }
}
