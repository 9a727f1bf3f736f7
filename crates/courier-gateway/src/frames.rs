use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use courier_db::MessageDraft;
use courier_types::frames::{
    ClientFrame, ReadReceiptPayload, SendMessagePayload, ServerFrame, TypingPayload,
};
use courier_types::models::DeliveryState;

use crate::manager::{encode, Enqueue, Session, SessionManager};

/// Dispatch one inbound text frame from a session's read pump.
///
/// Unknown types are logged and dropped. A payload that fails to parse is
/// dropped silently unless a `temp_id` can still be dug out of it, in which
/// case the sender gets a negative ack to resolve its optimistic message.
pub(crate) async fn dispatch(manager: &SessionManager, session: &Arc<Session>, raw: &str) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection_id = %session.id, "unparseable frame: {e}");
            return;
        }
    };

    match frame.kind.as_str() {
        "send_message" => handle_send_message(manager, session, frame.data).await,
        "typing" => handle_typing(manager, session, frame.data).await,
        "read_receipt" => handle_read_receipt(manager, session, frame.data).await,
        other => {
            warn!(connection_id = %session.id, kind = other, "unknown frame type");
        }
    }
}

async fn handle_send_message(manager: &SessionManager, session: &Arc<Session>, data: Value) {
    let payload: SendMessagePayload = match serde_json::from_value(data.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(connection_id = %session.id, "bad send_message payload: {e}");
            if let Some(temp_id) = recover_temp_id(&data) {
                ack_error(session, temp_id, "invalid message format");
            }
            return;
        }
    };
    let temp_id = payload.temp_id.clone();

    // Resolve the conversation: an explicit id wins if it exists, otherwise
    // the direct conversation for this pair, created on first contact.
    let conversation = match payload.conversation_id {
        Some(id) => manager.messages().get_conversation(id).unwrap_or(None),
        None => None,
    };
    let conversation = match conversation {
        Some(conversation) => conversation,
        None => {
            match manager
                .messages()
                .get_or_create_conversation(&[session.user_id, payload.recipient_id])
            {
                Ok(conversation) => conversation,
                Err(e) => {
                    warn!(connection_id = %session.id, "failed to resolve conversation: {e}");
                    if let Some(temp_id) = temp_id {
                        ack_error(session, temp_id, "failed to create conversation");
                    }
                    return;
                }
            }
        }
    };

    let draft = MessageDraft {
        conversation_id: conversation.id,
        sender_id: session.user_id,
        content: payload.content,
        kind: payload.kind,
        media: None,
        replied_to: None,
        forwarded: false,
        recipients: vec![payload.recipient_id],
    };
    let message = match manager.messages().create_message(draft) {
        Ok(message) => message,
        Err(e) => {
            warn!(connection_id = %session.id, "failed to save message: {e}");
            if let Some(temp_id) = temp_id {
                ack_error(session, temp_id, "failed to save message");
            }
            return;
        }
    };

    // Fan out the full message to every live session of the recipient.
    manager
        .send_to_user(
            payload.recipient_id,
            ServerFrame::NewMessage {
                message: message.clone(),
            },
        )
        .await;

    if manager.is_user_connected(payload.recipient_id) {
        // Online-delivery upgrade: flip the recipient to `delivered` and
        // tell the sender. The store guard makes a duplicate a no-op.
        match manager.messages().update_status(
            message.id,
            payload.recipient_id,
            DeliveryState::Delivered,
        ) {
            Ok(true) => {
                manager
                    .send_to_user(
                        session.user_id,
                        ServerFrame::StatusUpdate {
                            message_id: message.id,
                            status: DeliveryState::Delivered,
                        },
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %message.id, "failed to mark delivered: {e}");
            }
        }
    } else {
        // No live session anywhere: park the message for the next register.
        if let Err(e) = manager.messages().queue_offline_message(
            payload.recipient_id,
            message.id,
            conversation.id,
        ) {
            warn!(message_id = %message.id, "failed to queue offline message: {e}");
        }
    }

    // Lightweight ack to the originating session only -- never the full
    // message echo, and never both a positive and an error ack.
    let ack = ServerFrame::ack(temp_id, message.id, message.timestamp);
    enqueue_direct(session, &ack);
}

async fn handle_typing(manager: &SessionManager, session: &Arc<Session>, data: Value) {
    let payload: TypingPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(connection_id = %session.id, "bad typing payload: {e}");
            return;
        }
    };

    // Ephemeral: fan out, nothing persisted.
    manager
        .send_to_user(
            payload.recipient_id,
            ServerFrame::Typing {
                user_id: session.user_id,
                is_typing: payload.is_typing,
            },
        )
        .await;
}

async fn handle_read_receipt(manager: &SessionManager, session: &Arc<Session>, data: Value) {
    let payload: ReadReceiptPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(connection_id = %session.id, "bad read_receipt payload: {e}");
            return;
        }
    };

    // The store guard rejects a backward move; an already-read message
    // advances nothing and notifies nobody.
    let advanced = match manager.messages().update_status(
        payload.message_id,
        session.user_id,
        DeliveryState::Read,
    ) {
        Ok(advanced) => advanced,
        Err(e) => {
            warn!(message_id = %payload.message_id, "failed to mark read: {e}");
            return;
        }
    };
    if !advanced {
        return;
    }

    match manager.messages().get_message(payload.message_id) {
        Ok(Some(message)) => {
            manager
                .send_to_user(
                    message.sender_id,
                    ServerFrame::StatusUpdate {
                        message_id: message.id,
                        status: DeliveryState::Read,
                    },
                )
                .await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(message_id = %payload.message_id, "failed to load message: {e}");
        }
    }
}

/// Best-effort `temp_id` recovery from a payload that failed to parse.
fn recover_temp_id(data: &Value) -> Option<String> {
    data.get("temp_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn ack_error(session: &Arc<Session>, temp_id: String, error: &str) {
    enqueue_direct(session, &ServerFrame::ack_error(temp_id, error));
}

/// Acks go straight onto the originating session's buffer, bypassing the
/// coordinator: they concern exactly one session, and the sender's other
/// sessions must not see them.
fn enqueue_direct(session: &Arc<Session>, frame: &ServerFrame) {
    let Some(payload) = encode(frame) else { return };
    match session.try_enqueue(payload) {
        Enqueue::Sent => {}
        Enqueue::Full | Enqueue::Closed => {
            warn!(
                connection_id = %session.id,
                "dropping ack, session buffer unavailable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Utf8Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::manager::tests::{test_manager, wait_until};

    async fn connect(
        manager: &SessionManager,
        user_id: Uuid,
    ) -> (Arc<Session>, mpsc::Receiver<Utf8Bytes>) {
        let before = manager.session_count(user_id);
        let (session, rx) = Session::new(user_id);
        manager.register(session.clone()).await;
        let m = manager.clone();
        wait_until(move || m.session_count(user_id) > before).await;
        (session, rx)
    }

    async fn collect_frames(
        rx: &mut mpsc::Receiver<Utf8Bytes>,
        count: usize,
    ) -> Vec<serde_json::Value> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound buffer closed");
            frames.push(serde_json::from_str(&payload).unwrap());
        }
        frames
    }

    fn send_message_frame(recipient: Uuid, content: &str, temp_id: &str) -> String {
        json!({
            "type": "send_message",
            "data": {
                "recipient_id": recipient,
                "content": content,
                "type": "text",
                "temp_id": temp_id,
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn online_send_delivers_acks_and_upgrades() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let grace = db.create_user("grace", None, None, "h").unwrap().id;
        let (ada_session, mut ada_rx) = connect(&manager, ada).await;
        let (_grace_session, mut grace_rx) = connect(&manager, grace).await;

        dispatch(&manager, &ada_session, &send_message_frame(grace, "hi", "t1")).await;

        // Recipient sees the full message, still coarse-status sent
        let grace_frames = collect_frames(&mut grace_rx, 1).await;
        assert_eq!(grace_frames[0]["type"], "new_message");
        assert_eq!(grace_frames[0]["message"]["content"], "hi");
        assert_eq!(grace_frames[0]["message"]["sender_id"], ada.to_string());
        assert_eq!(grace_frames[0]["message"]["status"], "sent");

        // Sender sees exactly one ack and one delivered update, in some order
        let ada_frames = collect_frames(&mut ada_rx, 2).await;
        let ack = ada_frames
            .iter()
            .find(|f| f["type"] == "message_ack")
            .expect("no ack received");
        assert_eq!(ack["temp_id"], "t1");
        assert_eq!(ack["status"], "sent");
        assert!(ack["server_id"].is_string());

        let update = ada_frames
            .iter()
            .find(|f| f["type"] == "status_update")
            .expect("no status update received");
        assert_eq!(update["status"], "delivered");

        // Store agrees: the recipient entry is delivered
        let message_id = Uuid::parse_str(ack["server_id"].as_str().unwrap()).unwrap();
        let stored = db.get_message(message_id).unwrap().unwrap();
        assert_eq!(stored.delivery_status[0].user_id, grace);
        assert_eq!(
            stored.delivery_status[0].status,
            DeliveryState::Delivered
        );
    }

    #[tokio::test]
    async fn offline_recipient_send_queues_and_acks_without_upgrade() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let grace = db.create_user("grace", None, None, "h").unwrap().id;
        let (ada_session, mut ada_rx) = connect(&manager, ada).await;

        dispatch(&manager, &ada_session, &send_message_frame(grace, "hi", "t1")).await;

        let frames = collect_frames(&mut ada_rx, 1).await;
        assert_eq!(frames[0]["type"], "message_ack");
        assert_eq!(frames[0]["status"], "sent");

        // No delivered update may follow
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ada_rx.try_recv().is_err());

        assert_eq!(db.pending_queue_count(grace).unwrap(), 1);

        // Reconnect: the parked message arrives and the queue empties
        let (_grace_session, mut grace_rx) = connect(&manager, grace).await;
        let queued = collect_frames(&mut grace_rx, 1).await;
        assert_eq!(queued[0]["type"], "queued_message");
        assert_eq!(queued[0]["message"]["content"], "hi");
        assert_eq!(db.pending_queue_count(grace).unwrap(), 0);
    }

    #[tokio::test]
    async fn read_receipt_notifies_the_sender() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let grace = db.create_user("grace", None, None, "h").unwrap().id;
        let (ada_session, mut ada_rx) = connect(&manager, ada).await;
        let (grace_session, mut grace_rx) = connect(&manager, grace).await;

        dispatch(&manager, &ada_session, &send_message_frame(grace, "hi", "t1")).await;
        let ada_frames = collect_frames(&mut ada_rx, 2).await;
        let ack = ada_frames
            .iter()
            .find(|f| f["type"] == "message_ack")
            .unwrap();
        let message_id = Uuid::parse_str(ack["server_id"].as_str().unwrap()).unwrap();
        let _ = collect_frames(&mut grace_rx, 1).await;

        let receipt = json!({
            "type": "read_receipt",
            "data": { "message_id": message_id }
        })
        .to_string();
        dispatch(&manager, &grace_session, &receipt).await;

        let updates = collect_frames(&mut ada_rx, 1).await;
        assert_eq!(updates[0]["type"], "status_update");
        assert_eq!(updates[0]["status"], "read");
        assert_eq!(updates[0]["message_id"], message_id.to_string());

        let stored = db.get_message(message_id).unwrap().unwrap();
        assert_eq!(stored.delivery_status[0].status, DeliveryState::Read);

        // A second receipt for the same message advances nothing
        let receipt = json!({
            "type": "read_receipt",
            "data": { "message_id": message_id }
        })
        .to_string();
        dispatch(&manager, &grace_session, &receipt).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ada_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_is_relayed_and_not_persisted() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let grace = db.create_user("grace", None, None, "h").unwrap().id;
        let (ada_session, _ada_rx) = connect(&manager, ada).await;
        let (_grace_session, mut grace_rx) = connect(&manager, grace).await;

        let frame = json!({
            "type": "typing",
            "data": { "recipient_id": grace, "is_typing": true }
        })
        .to_string();
        dispatch(&manager, &ada_session, &frame).await;

        let frames = collect_frames(&mut grace_rx, 1).await;
        assert_eq!(frames[0]["type"], "typing");
        assert_eq!(frames[0]["user_id"], ada.to_string());
        assert_eq!(frames[0]["is_typing"], true);
    }

    #[tokio::test]
    async fn multi_session_recipient_gets_one_copy_per_session() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let grace = db.create_user("grace", None, None, "h").unwrap().id;
        let (ada_session, mut ada_rx) = connect(&manager, ada).await;
        let (_g1, mut grace_rx1) = connect(&manager, grace).await;
        let (_g2, mut grace_rx2) = connect(&manager, grace).await;

        dispatch(&manager, &ada_session, &send_message_frame(grace, "hi", "t1")).await;

        let first = collect_frames(&mut grace_rx1, 1).await;
        let second = collect_frames(&mut grace_rx2, 1).await;
        assert_eq!(first[0], second[0]);
        assert_eq!(first[0]["type"], "new_message");

        // Exactly one delivered update for the sender, not one per session
        let ada_frames = collect_frames(&mut ada_rx, 2).await;
        let updates: Vec<_> = ada_frames
            .iter()
            .filter(|f| f["type"] == "status_update")
            .collect();
        assert_eq!(updates.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ada_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_payload_with_temp_id_gets_an_error_ack() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let (session, mut rx) = connect(&manager, ada).await;

        // recipient_id is missing entirely
        let frame = json!({
            "type": "send_message",
            "data": { "content": "hi", "type": "text", "temp_id": "t9" }
        })
        .to_string();
        dispatch(&manager, &session, &frame).await;

        let frames = collect_frames(&mut rx, 1).await;
        assert_eq!(frames[0]["type"], "message_ack");
        assert_eq!(frames[0]["temp_id"], "t9");
        assert!(frames[0]["error"].is_string());
        assert!(frames[0].get("server_id").is_none());
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_dropped() {
        let (manager, db) = test_manager();
        let ada = db.create_user("ada", None, None, "h").unwrap().id;
        let (session, mut rx) = connect(&manager, ada).await;

        dispatch(&manager, &session, "not json at all").await;
        dispatch(
            &manager,
            &session,
            &json!({"type": "presence_hint", "data": {}}).to_string(),
        )
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
