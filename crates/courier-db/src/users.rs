use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use courier_types::models::{
    LastSeenPrivacy, Presence, PresenceStatus, User, UserSettings,
};

use crate::{bad_enum, fmt_ts, parse_ts, parse_uuid, Database, OptionalExt};

/// Partial profile update. `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub profile_picture: Option<String>,
    pub status_message: Option<String>,
    pub read_receipts: Option<bool>,
    pub last_seen_privacy: Option<LastSeenPrivacy>,
}

const USER_COLUMNS: &str = "id, username, email, phone, password_hash, profile_picture, \
     status_message, presence_status, presence_last_seen, presence_connection_id, \
     presence_device_id, read_receipts, last_seen_privacy, created_at, updated_at";

impl Database {
    /// Insert a new user. The store assigns the id; the caller supplies an
    /// already-hashed password. New users start offline with default settings.
    pub fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        phone: Option<&str>,
        password_hash: &str,
    ) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            password_hash: password_hash.to_string(),
            profile_picture: None,
            status_message: None,
            presence: Presence {
                status: PresenceStatus::Offline,
                last_seen: now,
                connection_id: None,
                device_id: None,
            },
            settings: UserSettings::default(),
            created_at: now,
            updated_at: now,
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, phone, password_hash,
                     presence_status, presence_last_seen, read_receipts,
                     last_seen_privacy, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.email,
                    user.phone,
                    user.password_hash,
                    user.presence.status.as_str(),
                    fmt_ts(user.presence.last_seen),
                    user.settings.read_receipts,
                    user.settings.last_seen_privacy.as_str(),
                    fmt_ts(user.created_at),
                    fmt_ts(user.updated_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
            ))?;
            stmt.query_row([id.to_string()], user_from_row).optional()
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE username = ?1"
            ))?;
            stmt.query_row([username], user_from_row).optional()
        })
    }

    /// Substring match over username and email. SQLite's LIKE is already
    /// case-insensitive for ASCII.
    pub fn search_users(&self, query: &str, limit: i64) -> Result<Vec<User>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE username LIKE ?1 ESCAPE '\\'
                    OR email LIKE ?1 ESCAPE '\\'
                 LIMIT ?2"
            ))?;
            let users = stmt
                .query_map(params![pattern, limit], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(users)
        })
    }

    pub fn update_user_profile(&self, id: Uuid, update: &ProfileUpdate) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(email) = &update.email {
            sets.push("email = ?");
            values.push(Box::new(email.clone()));
        }
        if let Some(phone) = &update.phone {
            sets.push("phone = ?");
            values.push(Box::new(phone.clone()));
        }
        if let Some(picture) = &update.profile_picture {
            sets.push("profile_picture = ?");
            values.push(Box::new(picture.clone()));
        }
        if let Some(status) = &update.status_message {
            sets.push("status_message = ?");
            values.push(Box::new(status.clone()));
        }
        if let Some(read_receipts) = update.read_receipts {
            sets.push("read_receipts = ?");
            values.push(Box::new(read_receipts));
        }
        if let Some(privacy) = update.last_seen_privacy {
            sets.push("last_seen_privacy = ?");
            values.push(Box::new(privacy.as_str()));
        }

        sets.push("updated_at = ?");
        values.push(Box::new(fmt_ts(Utc::now())));
        values.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE users SET {} WHERE id = ?",
            sets.join(", ")
        );

        self.with_conn_mut(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    pub fn set_presence_online(&self, user_id: Uuid, connection_id: Uuid) -> Result<()> {
        let now = fmt_ts(Utc::now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET presence_status = 'online',
                     presence_connection_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![user_id.to_string(), connection_id.to_string(), now],
            )?;
            Ok(())
        })
    }

    pub fn set_presence_offline(&self, user_id: Uuid) -> Result<()> {
        let now = fmt_ts(Utc::now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET presence_status = 'offline',
                     presence_last_seen = ?2, presence_connection_id = NULL,
                     updated_at = ?2
                 WHERE id = ?1",
                params![user_id.to_string(), now],
            )?;
            Ok(())
        })
    }

    /// Presence projection for a batch of users, one store read.
    pub fn presence_for(&self, user_ids: &[Uuid]) -> Result<Vec<(Uuid, Presence)>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, presence_status, presence_last_seen,
                    presence_connection_id, presence_device_id
             FROM users WHERE id IN ({placeholders})"
        );
        let ids: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                    let id = parse_uuid(0, row.get(0)?)?;
                    Ok((id, presence_from_row(row, 1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let read_receipts: bool = row.get(11)?;
    let privacy: String = row.get(12)?;

    Ok(User {
        id: parse_uuid(0, row.get(0)?)?,
        username: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        password_hash: row.get(4)?,
        profile_picture: row.get(5)?,
        status_message: row.get(6)?,
        presence: presence_from_row(row, 7)?,
        settings: UserSettings {
            read_receipts,
            last_seen_privacy: LastSeenPrivacy::parse(&privacy)
                .ok_or_else(|| bad_enum(12, &privacy))?,
        },
        created_at: parse_ts(13, row.get(13)?)?,
        updated_at: parse_ts(14, row.get(14)?)?,
    })
}

/// Read the four presence columns starting at `base`.
fn presence_from_row(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Presence> {
    let status: String = row.get(base)?;
    let connection_id: Option<String> = row.get(base + 2)?;

    Ok(Presence {
        status: PresenceStatus::parse(&status).ok_or_else(|| bad_enum(base, &status))?,
        last_seen: parse_ts(base + 1, row.get(base + 1)?)?,
        connection_id: connection_id
            .map(|s| parse_uuid(base + 2, s))
            .transpose()?,
        device_id: row.get(base + 3)?,
    })
}

/// Shared by contacts queries, which join back to the users table.
pub(crate) fn select_users(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(sql)?;
    let users = stmt
        .query_map(params, user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_user() {
        let db = Database::open_in_memory().unwrap();
        let user = db
            .create_user("ada", Some("ada@example.com"), None, "hash")
            .unwrap();

        let fetched = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(fetched.username, "ada");
        assert_eq!(fetched.email.as_deref(), Some("ada@example.com"));
        assert_eq!(fetched.presence.status, PresenceStatus::Offline);
        assert!(fetched.settings.read_receipts);

        let by_name = db.get_user_by_username("ada").unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
    }

    #[test]
    fn duplicate_username_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("ada", None, None, "hash").unwrap();

        let err = db.create_user("ada", None, None, "hash2").unwrap_err();
        assert!(crate::is_unique_violation(&err));
    }

    #[test]
    fn absent_email_does_not_collide() {
        // email is unique but nullable; two users without one must coexist
        let db = Database::open_in_memory().unwrap();
        db.create_user("ada", None, None, "h1").unwrap();
        db.create_user("grace", None, None, "h2").unwrap();
    }

    #[test]
    fn presence_transitions_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("ada", None, None, "hash").unwrap();
        let conn_id = Uuid::new_v4();

        db.set_presence_online(user.id, conn_id).unwrap();
        let online = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(online.presence.status, PresenceStatus::Online);
        assert_eq!(online.presence.connection_id, Some(conn_id));

        db.set_presence_offline(user.id).unwrap();
        let offline = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(offline.presence.status, PresenceStatus::Offline);
        assert_eq!(offline.presence.connection_id, None);
        assert!(offline.presence.last_seen >= online.presence.last_seen);
    }

    #[test]
    fn search_matches_username_case_insensitively() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("Ada_Lovelace", None, None, "h").unwrap();
        db.create_user("grace", Some("grace@navy.mil"), None, "h").unwrap();

        let hits = db.search_users("ada", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].username, "Ada_Lovelace");

        let by_email = db.search_users("navy", 10).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].username, "grace");
    }

    #[test]
    fn profile_update_touches_only_provided_fields() {
        let db = Database::open_in_memory().unwrap();
        let user = db
            .create_user("ada", Some("ada@example.com"), None, "hash")
            .unwrap();

        db.update_user_profile(
            user.id,
            &ProfileUpdate {
                status_message: Some("out to lunch".into()),
                read_receipts: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

        let updated = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(updated.status_message.as_deref(), Some("out to lunch"));
        assert!(!updated.settings.read_receipts);
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));
        assert_eq!(updated.password_hash, "hash");
    }
}
