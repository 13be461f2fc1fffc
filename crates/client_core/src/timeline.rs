use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, DecryptedPlaintext, MessageId, SystemMessageKind, UserId},
    error::FailureKind,
};

use crate::optimistic::{Confirmation, OptimisticMessage};

pub const DEFAULT_RECONCILE_WINDOW_SECS: i64 = 120;

/// A message as the server ordered it. `(epoch, seq)` is strictly increasing
/// within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub server_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub epoch: u64,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedContent {
    Decrypted(DecryptedPlaintext),
    Undecryptable(FailureKind),
    /// Ciphertext has not been fetched or decrypted yet.
    Pending,
}

impl ConfirmedContent {
    fn completeness(&self) -> u8 {
        match self {
            Self::Decrypted(_) => 2,
            Self::Undecryptable(_) => 1,
            Self::Pending => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedEntry {
    pub message: ConfirmedMessage,
    pub content: ConfirmedContent,
}

impl ConfirmedEntry {
    fn confirmation(&self) -> Option<Confirmation<'_>> {
        let ConfirmedContent::Decrypted(plaintext) = &self.content else {
            return None;
        };
        Some(Confirmation {
            conversation_id: &self.message.conversation_id,
            sender_id: &self.message.sender_id,
            text: &plaintext.text,
            embed: plaintext.embed.as_ref(),
            created_at: self.message.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub id: String,
    pub kind: SystemMessageKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayMessage {
    Optimistic(OptimisticMessage),
    Confirmed(ConfirmedEntry),
    /// `ordinal` is the message's position by timestamp among the system
    /// messages of one merge.
    System { message: SystemMessage, ordinal: u64 },
}

impl DisplayMessage {
    pub fn sort_key(&self) -> (u64, u64, DateTime<Utc>) {
        match self {
            Self::Optimistic(pending) => (u64::MAX, u64::MAX, pending.created_at),
            Self::Confirmed(entry) => (entry.message.epoch, entry.message.seq, entry.message.created_at),
            Self::System { message, ordinal } => (0, *ordinal, message.created_at),
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Optimistic(pending) => pending.client_id.to_string(),
            Self::Confirmed(entry) => entry.message.server_id.to_string(),
            Self::System { message, .. } => message.id.clone(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::System { .. } => 0,
            Self::Confirmed(_) => 1,
            Self::Optimistic(_) => 2,
        }
    }

    fn display_order(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.rank().cmp(&other.rank()))
            .then_with(|| self.id().cmp(&other.id()))
    }
}

pub fn merge(
    optimistic: &[OptimisticMessage],
    confirmed: &[ConfirmedEntry],
    system: &[SystemMessage],
) -> Vec<DisplayMessage> {
    merge_with_window(
        optimistic,
        confirmed,
        system,
        Duration::seconds(DEFAULT_RECONCILE_WINDOW_SECS),
    )
}

/// Builds the displayed timeline. Pure: the same inputs always give the same
/// output, and an optimistic message that already has a decrypted confirmed
/// counterpart is not shown twice.
pub fn merge_with_window(
    optimistic: &[OptimisticMessage],
    confirmed: &[ConfirmedEntry],
    system: &[SystemMessage],
    window: Duration,
) -> Vec<DisplayMessage> {
    let confirmed = dedup_confirmed(confirmed);

    let mut consumed = vec![false; optimistic.len()];
    for entry in &confirmed {
        let Some(confirmation) = entry.confirmation() else {
            continue;
        };
        let matched = optimistic
            .iter()
            .enumerate()
            .filter(|(i, pending)| !consumed[*i] && pending.matches(&confirmation, window))
            .min_by(|(_, a), (_, b)| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.client_id.cmp(&b.client_id))
            })
            .map(|(i, _)| i);
        if let Some(i) = matched {
            consumed[i] = true;
        }
    }

    let mut system_sorted: Vec<&SystemMessage> = system.iter().collect();
    system_sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    system_sorted.dedup_by(|a, b| a.id == b.id);

    let mut timeline: Vec<DisplayMessage> = confirmed
        .into_iter()
        .map(DisplayMessage::Confirmed)
        .chain(
            system_sorted
                .into_iter()
                .enumerate()
                .map(|(ordinal, message)| DisplayMessage::System {
                    message: message.clone(),
                    ordinal: ordinal as u64,
                }),
        )
        .chain(
            optimistic
                .iter()
                .zip(consumed)
                .filter(|(_, consumed)| !consumed)
                .map(|(pending, _)| DisplayMessage::Optimistic(pending.clone())),
        )
        .collect();
    timeline.sort_by(DisplayMessage::display_order);
    timeline
}

/// One entry per server id, keeping the most resolved content, in ratchet
/// order.
fn dedup_confirmed(confirmed: &[ConfirmedEntry]) -> Vec<ConfirmedEntry> {
    let mut by_id: HashMap<&MessageId, &ConfirmedEntry> = HashMap::new();
    for entry in confirmed {
        by_id
            .entry(&entry.message.server_id)
            .and_modify(|kept| {
                if entry.content.completeness() > kept.content.completeness() {
                    *kept = entry;
                }
            })
            .or_insert(entry);
    }
    let mut deduped: Vec<ConfirmedEntry> = by_id.into_values().cloned().collect();
    deduped.sort_by(|a, b| {
        (a.message.epoch, a.message.seq, a.message.created_at)
            .cmp(&(b.message.epoch, b.message.seq, b.message.created_at))
            .then_with(|| a.message.server_id.cmp(&b.message.server_id))
    });
    deduped
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
