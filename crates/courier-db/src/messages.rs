use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use courier_types::models::{
    DeliveryState, DeliveryStatus, Media, Message, MessageKind,
};

use crate::{bad_enum, fmt_ts, parse_ts, parse_uuid, Database, OptionalExt};

/// Everything the caller decides about a new message. The store assigns the
/// id and the timestamp and starts every recipient at `sent`.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub media: Option<Media>,
    pub replied_to: Option<Uuid>,
    pub forwarded: bool,
    pub recipients: Vec<Uuid>,
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, kind, \
     media_url, media_thumbnail, media_size, media_mime, sent_at, status, \
     replied_to, forwarded, deleted";

impl Database {
    pub fn insert_message(&self, draft: MessageDraft) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            content: draft.content,
            kind: draft.kind,
            media: draft.media,
            timestamp: now,
            status: DeliveryState::Sent,
            delivery_status: draft
                .recipients
                .iter()
                .map(|&user_id| DeliveryStatus {
                    user_id,
                    status: DeliveryState::Sent,
                    timestamp: now,
                })
                .collect(),
            replied_to: draft.replied_to,
            forwarded: draft.forwarded,
            deleted: false,
            deleted_for: Vec::new(),
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, kind,
                     media_url, media_thumbnail, media_size, media_mime,
                     sent_at, status, replied_to, forwarded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    message.content,
                    message.kind.as_str(),
                    message.media.as_ref().map(|m| m.url.clone()),
                    message.media.as_ref().and_then(|m| m.thumbnail.clone()),
                    message.media.as_ref().map(|m| m.size),
                    message.media.as_ref().map(|m| m.mime_type.clone()),
                    fmt_ts(message.timestamp),
                    message.status.as_str(),
                    message.replied_to.map(|id| id.to_string()),
                    message.forwarded,
                ],
            )?;

            for status in &message.delivery_status {
                conn.execute(
                    "INSERT INTO message_recipients (message_id, user_id, status, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message.id.to_string(),
                        status.user_id.to_string(),
                        status.status.as_str(),
                        fmt_ts(status.timestamp),
                    ],
                )?;
            }
            Ok(())
        })?;

        Ok(message)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
            ))?;
            let row = stmt
                .query_row([id.to_string()], message_from_row)
                .optional()?;

            match row {
                Some(mut message) => {
                    load_delivery(conn, &mut message)?;
                    Ok(Some(message))
                }
                None => Ok(None),
            }
        })
    }

    /// One page of a conversation, newest first, soft-deleted excluded. The
    /// caller reverses the page for chronological display.
    pub fn get_messages_page(
        &self,
        conversation_id: Uuid,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND deleted = 0
                 ORDER BY sent_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let mut messages = stmt
                .query_map(
                    params![conversation_id.to_string(), limit, skip],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for message in &mut messages {
                load_delivery(conn, message)?;
            }
            Ok(messages)
        })
    }

    /// Move a recipient's delivery state forward. The update is conditional
    /// on the stored rank preceding the new one, so a backward or equal
    /// write is a no-op even when sessions race. An absent recipient row is
    /// also a no-op, not an error.
    ///
    /// Returns whether a row actually advanced.
    pub fn update_delivery_status(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        status: DeliveryState,
    ) -> Result<bool> {
        let changed = self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE message_recipients SET status = ?3, updated_at = ?4
                 WHERE message_id = ?1 AND user_id = ?2
                   AND (CASE status
                            WHEN 'sent' THEN 0
                            WHEN 'delivered' THEN 1
                            WHEN 'read' THEN 2
                        END)
                     < (CASE ?3
                            WHEN 'sent' THEN 0
                            WHEN 'delivered' THEN 1
                            WHEN 'read' THEN 2
                        END)",
                params![
                    message_id.to_string(),
                    user_id.to_string(),
                    status.as_str(),
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(n)
        })?;
        Ok(changed > 0)
    }
}

pub(crate) fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(4)?;
    let status: String = row.get(10)?;
    let replied_to: Option<String> = row.get(11)?;

    let media = match row.get::<_, Option<String>>(5)? {
        Some(url) => {
            let mime: Option<String> = row.get(8)?;
            Some(Media {
                url,
                thumbnail: row.get(6)?,
                size: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                mime_type: mime.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(Message {
        id: parse_uuid(0, row.get(0)?)?,
        conversation_id: parse_uuid(1, row.get(1)?)?,
        sender_id: parse_uuid(2, row.get(2)?)?,
        content: row.get(3)?,
        kind: MessageKind::parse(&kind).ok_or_else(|| bad_enum(4, &kind))?,
        media,
        timestamp: parse_ts(9, row.get(9)?)?,
        status: DeliveryState::parse(&status).ok_or_else(|| bad_enum(10, &status))?,
        delivery_status: Vec::new(),
        replied_to: replied_to.map(|s| parse_uuid(11, s)).transpose()?,
        forwarded: row.get(12)?,
        deleted: row.get(13)?,
        deleted_for: Vec::new(),
    })
}

pub(crate) fn load_delivery(conn: &Connection, message: &mut Message) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT user_id, status, updated_at FROM message_recipients
         WHERE message_id = ?1 ORDER BY rowid",
    )?;
    message.delivery_status = stmt
        .query_map([message.id.to_string()], |row| {
            let status: String = row.get(1)?;
            Ok(DeliveryStatus {
                user_id: parse_uuid(0, row.get(0)?)?,
                status: DeliveryState::parse(&status).ok_or_else(|| bad_enum(1, &status))?,
                timestamp: parse_ts(2, row.get(2)?)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut hidden = conn.prepare(
        "SELECT user_id FROM message_deleted_for WHERE message_id = ?1",
    )?;
    message.deleted_for = hidden
        .query_map([message.id.to_string()], |row| parse_uuid(0, row.get(0)?))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(())
}
