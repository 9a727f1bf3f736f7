use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use courier_types::models::{Message, OfflineQueueEntry, QueueStatus};

use crate::{fmt_ts, messages, parse_uuid, Database};

/// Default priority for fresh entries; lower drains first.
const DEFAULT_PRIORITY: i64 = 1;

impl Database {
    /// Queue a message for a user who had no live session at send time.
    pub fn enqueue_offline_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<OfflineQueueEntry> {
        let entry = OfflineQueueEntry {
            id: Uuid::new_v4(),
            user_id,
            message_id,
            conversation_id,
            priority: DEFAULT_PRIORITY,
            status: QueueStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            last_retry: None,
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO message_queue (id, user_id, message_id, conversation_id,
                     priority, status, retry_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.to_string(),
                    entry.user_id.to_string(),
                    entry.message_id.to_string(),
                    entry.conversation_id.to_string(),
                    entry.priority,
                    entry.status.as_str(),
                    entry.retry_count,
                    fmt_ts(entry.created_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(entry)
    }

    /// Drain up to `limit` pending entries for a user: highest priority
    /// (lowest number) first, oldest first within a priority. The drained
    /// queue rows are deleted before this returns, so a second call never
    /// hands back the same messages.
    pub fn drain_queued_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id FROM message_queue
                 WHERE user_id = ?1 AND status = 'pending'
                 ORDER BY priority ASC, created_at ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![user_id.to_string(), limit], |row| {
                    let entry_id: String = row.get(0)?;
                    let message_id = parse_uuid(1, row.get(1)?)?;
                    Ok((entry_id, message_id))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if entries.is_empty() {
                return Ok(Vec::new());
            }

            let mut drained = Vec::with_capacity(entries.len());
            for (_, message_id) in &entries {
                let mut fetch = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE id = ?1",
                    messages::MESSAGE_COLUMNS
                ))?;
                let row = fetch.query_row([message_id.to_string()], messages::message_from_row);
                match row {
                    Ok(mut message) => {
                        messages::load_delivery(conn, &mut message)?;
                        drained.push(message);
                    }
                    // A queue entry may outlive its message; skip it.
                    Err(rusqlite::Error::QueryReturnedNoRows) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let placeholders = vec!["?"; entries.len()].join(", ");
            let ids: Vec<&String> = entries.iter().map(|(id, _)| id).collect();
            conn.execute(
                &format!("DELETE FROM message_queue WHERE id IN ({placeholders})"),
                rusqlite::params_from_iter(ids.iter()),
            )?;

            Ok(drained)
        })
    }

    pub fn pending_queue_count(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM message_queue
                 WHERE user_id = ?1 AND status = 'pending'",
                [user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageDraft;
    use courier_types::models::{ConversationKind, MessageKind};

    fn seed(db: &Database) -> (Uuid, Uuid, Uuid) {
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;
        let conv = db
            .create_conversation(ConversationKind::Direct, &[a, b], None)
            .unwrap()
            .id;
        (a, b, conv)
    }

    fn send(db: &Database, conv: Uuid, from: Uuid, to: Uuid, content: &str) -> Message {
        db.insert_message(MessageDraft {
            conversation_id: conv,
            sender_id: from,
            content: content.into(),
            kind: MessageKind::Text,
            media: None,
            replied_to: None,
            forwarded: false,
            recipients: vec![to],
        })
        .unwrap()
    }

    #[test]
    fn drain_returns_messages_oldest_first_and_empties_the_queue() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conv) = seed(&db);

        let m1 = send(&db, conv, a, b, "one");
        let m2 = send(&db, conv, a, b, "two");
        db.enqueue_offline_message(b, m1.id, conv).unwrap();
        db.enqueue_offline_message(b, m2.id, conv).unwrap();

        let drained = db.drain_queued_messages(b, 100).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, m1.id);
        assert_eq!(drained[1].id, m2.id);
        assert_eq!(db.pending_queue_count(b).unwrap(), 0);
    }

    #[test]
    fn successive_drains_are_disjoint() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conv) = seed(&db);

        for i in 0..5 {
            let m = send(&db, conv, a, b, &format!("m{i}"));
            db.enqueue_offline_message(b, m.id, conv).unwrap();
        }

        let first = db.drain_queued_messages(b, 3).unwrap();
        let second = db.drain_queued_messages(b, 100).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        for m in &first {
            assert!(second.iter().all(|other| other.id != m.id));
        }

        assert!(db.drain_queued_messages(b, 100).unwrap().is_empty());
    }

    #[test]
    fn lower_priority_number_drains_first() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conv) = seed(&db);

        let normal = send(&db, conv, a, b, "normal");
        let urgent = send(&db, conv, a, b, "urgent");
        db.enqueue_offline_message(b, normal.id, conv).unwrap();
        let entry = db.enqueue_offline_message(b, urgent.id, conv).unwrap();
        db.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE message_queue SET priority = 0 WHERE id = ?1",
                [entry.id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        let drained = db.drain_queued_messages(b, 1).unwrap();
        assert_eq!(drained[0].id, urgent.id);
    }

    #[test]
    fn drain_scopes_to_the_requested_user() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conv) = seed(&db);

        let m = send(&db, conv, a, b, "hi");
        db.enqueue_offline_message(b, m.id, conv).unwrap();

        assert!(db.drain_queued_messages(a, 100).unwrap().is_empty());
        assert_eq!(db.pending_queue_count(b).unwrap(), 1);
    }
}
