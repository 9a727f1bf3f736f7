use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use courier_types::models::ActiveConnection;

use crate::{fmt_ts, parse_ts, parse_uuid, Database, OptionalExt};

impl Database {
    pub fn insert_active_connection(&self, record: &ActiveConnection) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO active_connections
                     (connection_id, user_id, device_id, device_type,
                      connected_at, last_heartbeat, server_instance, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.connection_id.to_string(),
                    record.user_id.to_string(),
                    record.device_id,
                    record.device_type,
                    fmt_ts(record.connected_at),
                    fmt_ts(record.last_heartbeat),
                    record.server_instance,
                    fmt_ts(record.expires_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Record a pong: push both the heartbeat and the expiry forward.
    pub fn touch_connection_heartbeat(
        &self,
        connection_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE active_connections
                 SET last_heartbeat = ?2, expires_at = ?3
                 WHERE connection_id = ?1",
                params![
                    connection_id.to_string(),
                    fmt_ts(Utc::now()),
                    fmt_ts(expires_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_active_connection(&self, connection_id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM active_connections WHERE connection_id = ?1",
                [connection_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_active_connection(&self, connection_id: Uuid) -> Result<Option<ActiveConnection>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT connection_id, user_id, device_id, device_type,
                        connected_at, last_heartbeat, server_instance, expires_at
                 FROM active_connections WHERE connection_id = ?1",
            )?;
            stmt.query_row([connection_id.to_string()], |row| {
                Ok(ActiveConnection {
                    connection_id: parse_uuid(0, row.get(0)?)?,
                    user_id: parse_uuid(1, row.get(1)?)?,
                    device_id: row.get(2)?,
                    device_type: row.get(3)?,
                    connected_at: parse_ts(4, row.get(4)?)?,
                    last_heartbeat: parse_ts(5, row.get(5)?)?,
                    server_instance: row.get(6)?,
                    expires_at: parse_ts(7, row.get(7)?)?,
                })
            })
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(user_id: Uuid) -> ActiveConnection {
        let now = Utc::now();
        ActiveConnection {
            connection_id: Uuid::new_v4(),
            user_id,
            device_id: None,
            device_type: "web".into(),
            connected_at: now,
            last_heartbeat: now,
            server_instance: "server-1".into(),
            expires_at: now + Duration::minutes(5),
        }
    }

    #[test]
    fn insert_touch_delete_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("ada", None, None, "h").unwrap().id;
        let rec = record(user);

        db.insert_active_connection(&rec).unwrap();
        let stored = db.get_active_connection(rec.connection_id).unwrap().unwrap();
        assert_eq!(stored.user_id, user);
        assert_eq!(stored.server_instance, "server-1");

        let new_expiry = Utc::now() + Duration::minutes(10);
        db.touch_connection_heartbeat(rec.connection_id, new_expiry)
            .unwrap();
        let touched = db.get_active_connection(rec.connection_id).unwrap().unwrap();
        assert!(touched.expires_at > stored.expires_at);
        assert!(touched.last_heartbeat >= stored.last_heartbeat);

        db.delete_active_connection(rec.connection_id).unwrap();
        assert!(db
            .get_active_connection(rec.connection_id)
            .unwrap()
            .is_none());
    }
}
