use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use courier_db::{Database, MessageDraft};
use courier_types::models::{
    Conversation, ConversationKind, DeliveryState, LastMessage, Message,
};

/// Message creation, conversation lookup, delivery-status bookkeeping and
/// the offline queue.
#[derive(Clone)]
pub struct MessageService {
    db: Arc<Database>,
}

impl MessageService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a message. The store assigns id and timestamp and starts the
    /// coarse status at `sent`. Refreshing the conversation's last-message
    /// snapshot is best-effort: a failure there is logged, never propagated.
    pub fn create_message(&self, draft: MessageDraft) -> Result<Message> {
        let message = self.db.insert_message(draft)?;

        let snapshot = LastMessage {
            content: message.content.clone(),
            sender_id: message.sender_id,
            timestamp: message.timestamp,
            kind: message.kind,
        };
        if let Err(e) = self.db.set_last_message(message.conversation_id, &snapshot) {
            warn!(
                conversation_id = %message.conversation_id,
                "failed to update conversation last message: {e}"
            );
        }

        Ok(message)
    }

    pub fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.db.get_message(message_id)
    }

    /// One page of conversation history in chronological order. The store
    /// pages newest-first; the page is reversed here.
    pub fn get_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>> {
        let mut page = self.db.get_messages_page(conversation_id, limit, skip)?;
        page.reverse();
        Ok(page)
    }

    /// Advance one recipient's delivery state. Returns whether anything
    /// changed; an unknown recipient or a backward transition is a no-op.
    pub fn update_status(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        status: DeliveryState,
    ) -> Result<bool> {
        self.db.update_delivery_status(message_id, user_id, status)
    }

    pub fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        self.db.get_conversation(conversation_id)
    }

    /// The direct conversation for this exact participant set, created on
    /// first use.
    pub fn get_or_create_conversation(&self, user_ids: &[Uuid]) -> Result<Conversation> {
        if let Some(existing) = self.db.find_direct_conversation(user_ids)? {
            return Ok(existing);
        }
        self.db
            .create_conversation(ConversationKind::Direct, user_ids, None)
    }

    pub fn get_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.db.conversations_for_user(user_id)
    }

    pub fn queue_offline_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<()> {
        self.db
            .enqueue_offline_message(user_id, message_id, conversation_id)?;
        Ok(())
    }

    /// Drain up to `limit` queued messages for a reconnecting user. The
    /// drained queue rows are gone once this returns.
    pub fn get_queued_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        self.db.drain_queued_messages(user_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::models::MessageKind;

    fn service() -> (MessageService, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (MessageService::new(db.clone()), db)
    }

    fn draft(conv: Uuid, from: Uuid, to: Uuid, content: &str) -> MessageDraft {
        MessageDraft {
            conversation_id: conv,
            sender_id: from,
            content: content.into(),
            kind: MessageKind::Text,
            media: None,
            replied_to: None,
            forwarded: false,
            recipients: vec![to],
        }
    }

    #[test]
    fn direct_conversation_is_created_once() {
        let (service, db) = service();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;

        let first = service.get_or_create_conversation(&[a, b]).unwrap();
        let second = service.get_or_create_conversation(&[b, a]).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, ConversationKind::Direct);
    }

    #[test]
    fn create_message_refreshes_the_conversation_snapshot() {
        let (service, db) = service();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;
        let conv = service.get_or_create_conversation(&[a, b]).unwrap();

        let message = service
            .create_message(draft(conv.id, a, b, "hello"))
            .unwrap();
        assert_eq!(message.status, DeliveryState::Sent);

        let refreshed = service.get_conversation(conv.id).unwrap().unwrap();
        let last = refreshed.last_message.unwrap();
        assert_eq!(last.content, "hello");
        assert_eq!(last.sender_id, a);
        assert!(refreshed.updated_at >= conv.updated_at);
    }

    #[test]
    fn history_page_is_chronological() {
        let (service, db) = service();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;
        let conv = service.get_or_create_conversation(&[a, b]).unwrap();

        for i in 0..4 {
            service
                .create_message(draft(conv.id, a, b, &format!("m{i}")))
                .unwrap();
        }

        let page = service.get_messages(conv.id, 3, 0).unwrap();
        assert_eq!(page.len(), 3);
        // Newest three, oldest of them first
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[2].content, "m3");
    }

    #[test]
    fn queue_then_drain_round_trip() {
        let (service, db) = service();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;
        let conv = service.get_or_create_conversation(&[a, b]).unwrap();

        let message = service.create_message(draft(conv.id, a, b, "hi")).unwrap();
        service
            .queue_offline_message(b, message.id, conv.id)
            .unwrap();

        let drained = service.get_queued_messages(b, 100).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, message.id);
        assert!(service.get_queued_messages(b, 100).unwrap().is_empty());
    }
}
