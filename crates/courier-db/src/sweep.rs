use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::{fmt_ts, Database};

/// Queue entries older than this are abandoned.
const QUEUE_RETENTION_DAYS: i64 = 30;

/// Background task that enforces the store's time-to-live rules:
/// `active_connections` rows past `expires_at` (a session whose heartbeat
/// stopped without a clean unregister) and `message_queue` rows past the
/// retention window.
pub async fn run_expiry_loop(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep_expired(&db) {
            Ok((connections, queued)) => {
                if connections > 0 || queued > 0 {
                    info!(
                        connections, queued,
                        "expiry sweep removed stale rows"
                    );
                }
            }
            Err(e) => {
                warn!("expiry sweep error: {}", e);
            }
        }
    }
}

pub fn sweep_expired(db: &Database) -> anyhow::Result<(usize, usize)> {
    let now = fmt_ts(Utc::now());
    let queue_cutoff = fmt_ts(Utc::now() - chrono::Duration::days(QUEUE_RETENTION_DAYS));

    let connections = db.with_conn_mut(|conn| {
        let n = conn.execute(
            "DELETE FROM active_connections WHERE expires_at < ?1",
            [&now],
        )?;
        Ok(n)
    })?;

    let queued = db.with_conn_mut(|conn| {
        let n = conn.execute(
            "DELETE FROM message_queue WHERE created_at < ?1",
            [&queue_cutoff],
        )?;
        Ok(n)
    })?;

    Ok((connections, queued))
}
