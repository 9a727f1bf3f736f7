use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{DeliveryState, Message, MessageKind};

/// Inbound envelope. `data` stays untyped until the `type` string picks a
/// payload, so an unknown type can be logged without a parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub recipient_id: Uuid,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingPayload {
    pub recipient_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_id: Uuid,
}

/// Outbound frames, serialized once per broadcast and multicast as text.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage {
        message: Message,
    },
    QueuedMessage {
        message: Message,
    },
    MessageAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<DeliveryState>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StatusUpdate {
        message_id: Uuid,
        status: DeliveryState,
    },
    Typing {
        user_id: Uuid,
        is_typing: bool,
    },
}

impl ServerFrame {
    /// Positive ack for a persisted message, echoing the client's `temp_id`.
    pub fn ack(temp_id: Option<String>, server_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self::MessageAck {
            temp_id,
            server_id: Some(server_id),
            timestamp: Some(timestamp),
            status: Some(DeliveryState::Sent),
            error: None,
        }
    }

    pub fn ack_error(temp_id: String, error: impl Into<String>) -> Self {
        Self::MessageAck {
            temp_id: Some(temp_id),
            server_id: None,
            timestamp: None,
            status: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_keeps_payload_raw() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"send_message","data":{"recipient_id":"8c1a6f0e-46fb-4e58-a71f-6b31a1d0a001","content":"hi","type":"text","temp_id":"t1"}}"#,
        )
        .unwrap();

        assert_eq!(frame.kind, "send_message");
        let payload: SendMessagePayload = serde_json::from_value(frame.data).unwrap();
        assert_eq!(payload.content, "hi");
        assert_eq!(payload.kind, MessageKind::Text);
        assert_eq!(payload.temp_id.as_deref(), Some("t1"));
        assert!(payload.conversation_id.is_none());
    }

    #[test]
    fn positive_ack_shape() {
        let id = Uuid::new_v4();
        let frame = ServerFrame::ack(Some("t1".into()), id, Utc::now());
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "message_ack");
        assert_eq!(json["temp_id"], "t1");
        assert_eq!(json["server_id"], id.to_string());
        assert_eq!(json["status"], "sent");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_ack_shape() {
        let frame = ServerFrame::ack_error("t2".into(), "failed to save message");
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "message_ack");
        assert_eq!(json["temp_id"], "t2");
        assert_eq!(json["error"], "failed to save message");
        assert!(json.get("server_id").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn typing_frame_shape() {
        let user = Uuid::new_v4();
        let json = serde_json::to_value(ServerFrame::Typing {
            user_id: user,
            is_typing: true,
        })
        .unwrap();

        assert_eq!(json["type"], "typing");
        assert_eq!(json["user_id"], user.to_string());
        assert_eq!(json["is_typing"], true);
    }
}
