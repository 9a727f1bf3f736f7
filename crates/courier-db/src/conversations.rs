use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use courier_types::models::{
    Conversation, ConversationKind, LastMessage, MessageKind,
};

use crate::{bad_enum, fmt_ts, parse_ts, parse_uuid, Database, OptionalExt};

const CONVERSATION_COLUMNS: &str = "id, kind, created_by, name, description, \
     last_message_content, last_message_sender_id, last_message_kind, \
     last_message_at, created_at, updated_at";

impl Database {
    pub fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: &[Uuid],
        created_by: Option<Uuid>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind,
            participants: participants.to_vec(),
            created_by,
            name: None,
            description: None,
            admins: Vec::new(),
            last_message: None,
            created_at: now,
            updated_at: now,
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, kind, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id.to_string(),
                    kind.as_str(),
                    created_by.map(|id| id.to_string()),
                    fmt_ts(now),
                    fmt_ts(now),
                ],
            )?;
            for user_id in participants {
                conn.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id)
                     VALUES (?1, ?2)",
                    params![conversation.id.to_string(), user_id.to_string()],
                )?;
            }
            Ok(())
        })?;

        Ok(conversation)
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
            ))?;
            let row = stmt
                .query_row([id.to_string()], conversation_from_row)
                .optional()?;

            match row {
                Some(mut conversation) => {
                    load_members(conn, &mut conversation)?;
                    Ok(Some(conversation))
                }
                None => Ok(None),
            }
        })
    }

    /// The direct conversation whose participant set is exactly `user_ids`,
    /// if one exists. "Contains all of them AND has that many participants"
    /// is the uniqueness key for direct pairs.
    pub fn find_direct_conversation(&self, user_ids: &[Uuid]) -> Result<Option<Conversation>> {
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c
             WHERE c.kind = 'direct'
               AND (SELECT COUNT(*) FROM conversation_participants p
                    WHERE p.conversation_id = c.id) = {n}
               AND (SELECT COUNT(*) FROM conversation_participants p
                    WHERE p.conversation_id = c.id
                      AND p.user_id IN ({placeholders})) = {n}
             LIMIT 1",
            n = user_ids.len(),
        );
        let ids: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let row = stmt
                .query_row(rusqlite::params_from_iter(ids.iter()), conversation_from_row)
                .optional()?;

            match row {
                Some(mut conversation) => {
                    load_members(conn, &mut conversation)?;
                    Ok(Some(conversation))
                }
                None => Ok(None),
            }
        })
    }

    /// All conversations the user participates in, most recently updated
    /// first.
    pub fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC"
            ))?;
            let mut conversations = stmt
                .query_map([user_id.to_string()], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for conversation in &mut conversations {
                load_members(conn, conversation)?;
            }
            Ok(conversations)
        })
    }

    /// Refresh the conversation's last-message snapshot and bump
    /// `updated_at`.
    pub fn set_last_message(&self, conversation_id: Uuid, last: &LastMessage) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE conversations SET
                     last_message_content = ?2, last_message_sender_id = ?3,
                     last_message_kind = ?4, last_message_at = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    conversation_id.to_string(),
                    last.content,
                    last.sender_id.to_string(),
                    last.kind.as_str(),
                    fmt_ts(last.timestamp),
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let kind: String = row.get(1)?;
    let created_by: Option<String> = row.get(2)?;

    let last_message = match row.get::<_, Option<String>>(5)? {
        Some(content) => {
            let sender: String = row.get(6)?;
            let msg_kind: String = row.get(7)?;
            Some(LastMessage {
                content,
                sender_id: parse_uuid(6, sender)?,
                kind: MessageKind::parse(&msg_kind).ok_or_else(|| bad_enum(7, &msg_kind))?,
                timestamp: parse_ts(8, row.get(8)?)?,
            })
        }
        None => None,
    };

    Ok(Conversation {
        id: parse_uuid(0, row.get(0)?)?,
        kind: ConversationKind::parse(&kind).ok_or_else(|| bad_enum(1, &kind))?,
        participants: Vec::new(),
        created_by: created_by.map(|s| parse_uuid(2, s)).transpose()?,
        name: row.get(3)?,
        description: row.get(4)?,
        admins: Vec::new(),
        last_message,
        created_at: parse_ts(9, row.get(9)?)?,
        updated_at: parse_ts(10, row.get(10)?)?,
    })
}

/// Fill `participants` and `admins` from the join table, insertion order.
fn load_members(conn: &Connection, conversation: &mut Conversation) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT user_id, role FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([conversation.id.to_string()], |row| {
            let id = parse_uuid(0, row.get(0)?)?;
            let role: String = row.get(1)?;
            Ok((id, role))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    conversation.participants = rows.iter().map(|(id, _)| *id).collect();
    conversation.admins = rows
        .into_iter()
        .filter(|(_, role)| role == "admin")
        .map(|(id, _)| id)
        .collect();
    Ok(())
}
