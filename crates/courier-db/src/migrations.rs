use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Migrations, in order; index 0 is version 1. A schema change means a new
/// entry here, nothing else.
const MIGRATIONS: &[fn(&Connection) -> Result<()>] = &[migrate_v1];

/// Bring the schema up to date. Already-applied versions are skipped based
/// on the `schema_version` table, so this is safe to run on every startup.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    let latest = MIGRATIONS.len() as u32;
    info!("Database schema version: {} (latest: {})", applied, latest);

    for version in (applied + 1)..=latest {
        apply(conn, version)?;
    }
    Ok(())
}

/// One migration, one transaction: the version bump commits together with
/// the schema change or not at all. The immediate write lock keeps another
/// process from racing the same migration.
fn apply(conn: &Connection, version: u32) -> Result<()> {
    info!("Applying migration v{}", version);
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = MIGRATIONS[(version - 1) as usize](conn).and_then(|()| {
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        Ok(())
    });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!("Migration v{} applied", version);
            Ok(())
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK").ok();
            Err(anyhow::anyhow!("migration v{} failed: {}", version, e))
        }
    }
}

/// Version 1: full schema. The index set is a contract: the presence,
/// conversation, message, queue, contact and connection lookups all assume
/// these exist.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                      TEXT PRIMARY KEY,
            username                TEXT NOT NULL UNIQUE,
            email                   TEXT UNIQUE,
            phone                   TEXT UNIQUE,
            password_hash           TEXT NOT NULL,
            profile_picture         TEXT,
            status_message          TEXT,
            presence_status         TEXT NOT NULL DEFAULT 'offline',
            presence_last_seen      TEXT NOT NULL,
            presence_connection_id  TEXT,
            presence_device_id      TEXT,
            read_receipts           INTEGER NOT NULL DEFAULT 1,
            last_seen_privacy       TEXT NOT NULL DEFAULT 'everyone',
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_presence
            ON users(presence_status, presence_last_seen DESC);

        CREATE TABLE IF NOT EXISTS conversations (
            id                      TEXT PRIMARY KEY,
            kind                    TEXT NOT NULL,
            created_by              TEXT REFERENCES users(id),
            name                    TEXT,
            description             TEXT,
            last_message_content    TEXT,
            last_message_sender_id  TEXT,
            last_message_kind       TEXT,
            last_message_at         TEXT,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations(updated_at DESC);

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            role             TEXT NOT NULL DEFAULT 'member',
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            kind             TEXT NOT NULL,
            media_url        TEXT,
            media_thumbnail  TEXT,
            media_size       INTEGER,
            media_mime       TEXT,
            sent_at          TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'sent',
            replied_to       TEXT,
            forwarded        INTEGER NOT NULL DEFAULT 0,
            deleted          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, sent_at DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, sent_at DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_status
            ON messages(conversation_id, status);

        CREATE TABLE IF NOT EXISTS message_recipients (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL DEFAULT 'sent',
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS message_deleted_for (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS message_queue (
            id               TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL REFERENCES users(id),
            message_id       TEXT NOT NULL REFERENCES messages(id),
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            priority         INTEGER NOT NULL DEFAULT 1,
            status           TEXT NOT NULL DEFAULT 'pending',
            retry_count      INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            last_retry       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_queue_user
            ON message_queue(user_id, status, priority);
        CREATE INDEX IF NOT EXISTS idx_queue_created
            ON message_queue(created_at);

        CREATE TABLE IF NOT EXISTS contacts (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL REFERENCES users(id),
            contact_id    TEXT NOT NULL REFERENCES users(id),
            display_name  TEXT,
            blocked       INTEGER NOT NULL DEFAULT 0,
            added_at      TEXT NOT NULL,
            UNIQUE (user_id, contact_id)
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_blocked
            ON contacts(user_id, blocked);

        CREATE TABLE IF NOT EXISTS active_connections (
            connection_id    TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL REFERENCES users(id),
            device_id        TEXT,
            device_type      TEXT NOT NULL DEFAULT 'web',
            connected_at     TEXT NOT NULL,
            last_heartbeat   TEXT NOT NULL,
            server_instance  TEXT NOT NULL,
            expires_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_connections_user
            ON active_connections(user_id);
        CREATE INDEX IF NOT EXISTS idx_connections_heartbeat
            ON active_connections(last_heartbeat);
        CREATE INDEX IF NOT EXISTS idx_connections_expiry
            ON active_connections(expires_at);
        ",
    )?;
    Ok(())
}
