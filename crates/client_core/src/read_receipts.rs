use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, MessageId, ReadReceipt, UserId};
use storage::Storage;
use tracing::debug;

/// At most one receipt per (message, reader); a later mark replaces the
/// earlier one.
#[derive(Debug, Default, Clone)]
pub struct ReadReceiptStore {
    receipts: HashMap<(MessageId, UserId), ReadReceipt>,
}

impl ReadReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_as_read(
        &mut self,
        message_id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) {
        self.insert(ReadReceipt {
            message_id,
            conversation_id,
            user_id,
            read_at,
        });
    }

    pub fn read_count(&self, message_id: &MessageId) -> usize {
        self.receipts
            .keys()
            .filter(|(message, _)| message == message_id)
            .count()
    }

    pub fn is_read(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.receipts
            .contains_key(&(message_id.clone(), user_id.clone()))
    }

    pub fn read_date(&self, message_id: &MessageId, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.receipts
            .get(&(message_id.clone(), user_id.clone()))
            .map(|receipt| receipt.read_at)
    }

    /// Readers of `message_id`, earliest first.
    pub fn readers(&self, message_id: &MessageId) -> Vec<UserId> {
        let mut receipts: Vec<&ReadReceipt> = self
            .receipts
            .values()
            .filter(|receipt| &receipt.message_id == message_id)
            .collect();
        receipts.sort_by(|a, b| {
            a.read_at
                .cmp(&b.read_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        receipts
            .into_iter()
            .map(|receipt| receipt.user_id.clone())
            .collect()
    }

    /// Drops every receipt recorded for `conversation_id`. Returns how many
    /// were removed.
    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> usize {
        let before = self.receipts.len();
        self.receipts
            .retain(|_, receipt| &receipt.conversation_id != conversation_id);
        before - self.receipts.len()
    }

    pub fn hydrate(&mut self, receipts: impl IntoIterator<Item = ReadReceipt>) {
        for receipt in receipts {
            self.insert(receipt);
        }
    }

    pub fn snapshot(&self) -> Vec<ReadReceipt> {
        let mut receipts: Vec<ReadReceipt> = self.receipts.values().cloned().collect();
        receipts.sort_by(|a, b| {
            (&a.conversation_id, &a.message_id, &a.user_id)
                .cmp(&(&b.conversation_id, &b.message_id, &b.user_id))
        });
        receipts
    }

    /// Loads the persisted receipts of one conversation into memory.
    pub async fn hydrate_from(
        &mut self,
        storage: &Storage,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let receipts = storage.load_read_receipts(conversation_id).await?;
        let count = receipts.len();
        self.hydrate(receipts);
        debug!("receipts: hydrated {count} receipts for convo={conversation_id}");
        Ok(count)
    }

    /// Persists the receipt first, then records it in memory.
    pub async fn mark_as_read_durable(
        &mut self,
        storage: &Storage,
        receipt: ReadReceipt,
    ) -> Result<()> {
        storage.upsert_read_receipt(&receipt).await?;
        self.insert(receipt);
        Ok(())
    }

    pub async fn clear_conversation_durable(
        &mut self,
        storage: &Storage,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        storage.clear_read_receipts(conversation_id).await?;
        Ok(self.clear_conversation(conversation_id))
    }

    fn insert(&mut self, receipt: ReadReceipt) {
        self.receipts.insert(
            (receipt.message_id.clone(), receipt.user_id.clone()),
            receipt,
        );
    }
}
