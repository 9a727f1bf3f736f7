use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use courier_types::models::{Contact, User};

use crate::{fmt_ts, users::select_users, Database};

impl Database {
    /// Add a directed contact edge. A duplicate pair surfaces as a UNIQUE
    /// violation for the caller to translate.
    pub fn add_contact(
        &self,
        user_id: Uuid,
        contact_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<Contact> {
        let contact = Contact {
            id: Uuid::new_v4(),
            user_id,
            contact_id,
            display_name: display_name.map(str::to_string),
            blocked: false,
            added_at: Utc::now(),
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO contacts (id, user_id, contact_id, display_name, blocked, added_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    contact.id.to_string(),
                    contact.user_id.to_string(),
                    contact.contact_id.to_string(),
                    contact.display_name,
                    fmt_ts(contact.added_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(contact)
    }

    pub fn remove_contact(&self, user_id: Uuid, contact_id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM contacts WHERE user_id = ?1 AND contact_id = ?2",
                params![user_id.to_string(), contact_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// The user profiles behind a user's non-blocked contact edges.
    pub fn contacts_for_user(&self, user_id: Uuid) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            select_users(
                conn,
                "SELECT u.id, u.username, u.email, u.phone, u.password_hash,
                        u.profile_picture, u.status_message, u.presence_status,
                        u.presence_last_seen, u.presence_connection_id,
                        u.presence_device_id, u.read_receipts, u.last_seen_privacy,
                        u.created_at, u.updated_at
                 FROM contacts c
                 JOIN users u ON u.id = c.contact_id
                 WHERE c.user_id = ?1 AND c.blocked = 0
                 ORDER BY c.added_at",
                [user_id.to_string()],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_remove_contact() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;

        db.add_contact(a, b, Some("Grace H")).unwrap();
        let contacts = db.contacts_for_user(a).unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].username, "grace");

        // The edge is directed
        assert!(db.contacts_for_user(b).unwrap().is_empty());

        db.remove_contact(a, b).unwrap();
        assert!(db.contacts_for_user(a).unwrap().is_empty());
    }

    #[test]
    fn duplicate_pair_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;

        db.add_contact(a, b, None).unwrap();
        let err = db.add_contact(a, b, None).unwrap_err();
        assert!(crate::is_unique_violation(&err));
    }

    #[test]
    fn blocked_contacts_are_filtered() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;

        db.add_contact(a, b, None).unwrap();
        db.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE contacts SET blocked = 1 WHERE user_id = ?1 AND contact_id = ?2",
                params![a.to_string(), b.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(db.contacts_for_user(a).unwrap().is_empty());
    }
}
