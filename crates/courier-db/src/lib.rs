pub mod connections;
pub mod contacts;
pub mod conversations;
pub mod messages;
pub mod migrations;
pub mod queue;
pub mod sweep;
pub mod users;

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

pub use messages::MessageDraft;

/// Handle to the SQLite store.
///
/// Every query runs on one connection behind a `Mutex`. A `Connection`
/// carries interior `RefCell` state (`Send`, not `Sync`), which rules out
/// handing `&Connection` to several threads through an `RwLock`. WAL
/// journaling is enabled regardless, so a reader pool can be bolted on
/// later without a schema change.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::finish_setup(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Fresh in-memory store with the full schema. Test-only convenience,
    /// also handy for local smoke runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::finish_setup(Connection::open_in_memory()?)
    }

    fn finish_setup(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("store connection poisoned: {e}"))
    }

    /// Run a read-only query. Kept distinct from `with_conn_mut` so a
    /// reader/writer split can slot in later without touching call sites.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.lock()?;
        f(&guard)
    }

    /// Run statements that write.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.lock()?;
        f(&guard)
    }
}

/// True when an error is a SQLite UNIQUE constraint violation, so callers
/// can report duplicates (username, contact pair) instead of a bare 500.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .map(|e| {
            matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            )
        })
        .unwrap_or(false)
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so lexicographic
/// ORDER BY is chronological.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug)]
struct BadEnum(String);

impl std::fmt::Display for BadEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized stored value: {}", self.0)
    }
}

impl std::error::Error for BadEnum {}

/// A stored enum column holds a value no variant matches. Can only happen
/// if the file was written by foreign code.
pub(crate) fn bad_enum(idx: usize, s: &str) -> rusqlite::Error {
    conversion_err(idx, BadEnum(s.to_string()))
}

/// Turns "no rows" into `None` instead of an error, for lookups where an
/// absent row is a normal answer.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
