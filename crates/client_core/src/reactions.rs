use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{MessageId, Participant, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub reactors: BTreeSet<UserId>,
    pub is_reacted_by_current_user: bool,
}

/// Summaries for one message, most used emoji first and ties broken by emoji
/// code points.
pub fn aggregate(
    events: &[ReactionEvent],
    message_id: &MessageId,
    viewer: &impl Participant,
) -> Vec<ReactionSummary> {
    summarize(
        events.iter().filter(|event| &event.message_id == message_id),
        viewer.user_id(),
    )
}

pub fn aggregate_all(
    events: &[ReactionEvent],
    viewer: &impl Participant,
) -> BTreeMap<MessageId, Vec<ReactionSummary>> {
    let mut by_message: BTreeMap<&MessageId, Vec<&ReactionEvent>> = BTreeMap::new();
    for event in events {
        by_message.entry(&event.message_id).or_default().push(event);
    }
    by_message
        .into_iter()
        .map(|(message_id, events)| {
            (
                message_id.clone(),
                summarize(events.into_iter(), viewer.user_id()),
            )
        })
        .collect()
}

fn summarize<'a>(
    events: impl Iterator<Item = &'a ReactionEvent>,
    viewer: &UserId,
) -> Vec<ReactionSummary> {
    let mut by_emoji: BTreeMap<&str, BTreeSet<UserId>> = BTreeMap::new();
    for event in events {
        by_emoji
            .entry(event.emoji.as_str())
            .or_default()
            .insert(event.user_id.clone());
    }

    let mut summaries: Vec<ReactionSummary> = by_emoji
        .into_iter()
        .map(|(emoji, reactors)| ReactionSummary {
            emoji: emoji.to_string(),
            count: reactors.len(),
            is_reacted_by_current_user: reactors.iter().any(|r| r.same_identity(viewer)),
            reactors,
        })
        .collect();
    // UTF-8 byte order is code point order.
    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    summaries
}
