use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use courier_cache::ExpiringCache;
use courier_db::Database;
use courier_types::models::PresenceStatus;

/// Short TTL used for offline snapshots and store-backed fills, so readers
/// converge on the store within a minute without per-write invalidation.
const SHORT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct PresenceInfo {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub connections: Vec<Uuid>,
}

/// Presence reads are on the hot path of every send, so they go through the
/// expiring cache. Writes happen only from session register/unregister --
/// the session manager is the authority, not client self-report.
#[derive(Clone)]
pub struct PresenceService {
    db: Arc<Database>,
    cache: ExpiringCache<PresenceInfo>,
}

impl PresenceService {
    pub fn new(db: Arc<Database>, cache: ExpiringCache<PresenceInfo>) -> Self {
        Self { db, cache }
    }

    pub fn set_online(&self, user_id: Uuid, connection_id: Uuid) -> Result<()> {
        self.db.set_presence_online(user_id, connection_id)?;

        self.cache.set(
            cache_key(user_id),
            PresenceInfo {
                user_id,
                status: PresenceStatus::Online,
                last_seen: Utc::now(),
                connections: vec![connection_id],
            },
        );
        Ok(())
    }

    pub fn set_offline(&self, user_id: Uuid) -> Result<()> {
        self.db.set_presence_offline(user_id)?;

        self.cache.set_with_ttl(
            cache_key(user_id),
            PresenceInfo {
                user_id,
                status: PresenceStatus::Offline,
                last_seen: Utc::now(),
                connections: Vec::new(),
            },
            SHORT_TTL,
        );
        Ok(())
    }

    /// Cache-first read; a miss falls back to the store and refills the
    /// cache with the short TTL.
    pub fn get_presence(&self, user_id: Uuid) -> Result<Option<PresenceInfo>> {
        let key = cache_key(user_id);
        if let Some(info) = self.cache.get(&key) {
            return Ok(Some(info));
        }

        let Some(user) = self.db.get_user(user_id)? else {
            return Ok(None);
        };

        let info = PresenceInfo {
            user_id,
            status: user.presence.status,
            last_seen: user.presence.last_seen,
            connections: user.presence.connection_id.into_iter().collect(),
        };
        self.cache.set_with_ttl(key, info.clone(), SHORT_TTL);
        Ok(Some(info))
    }

    /// Batch probe: one store read covers every cache miss.
    pub fn get_multiple_presence(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, PresenceInfo>> {
        let mut result = HashMap::with_capacity(user_ids.len());
        let mut misses = Vec::new();

        for &user_id in user_ids {
            match self.cache.get(&cache_key(user_id)) {
                Some(info) => {
                    result.insert(user_id, info);
                }
                None => misses.push(user_id),
            }
        }

        if !misses.is_empty() {
            for (user_id, presence) in self.db.presence_for(&misses)? {
                let info = PresenceInfo {
                    user_id,
                    status: presence.status,
                    last_seen: presence.last_seen,
                    connections: presence.connection_id.into_iter().collect(),
                };
                self.cache
                    .set_with_ttl(cache_key(user_id), info.clone(), SHORT_TTL);
                result.insert(user_id, info);
            }
        }

        Ok(result)
    }

    pub fn is_online(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .get_presence(user_id)?
            .map(|info| info.status == PresenceStatus::Online)
            .unwrap_or(false))
    }
}

fn cache_key(user_id: Uuid) -> String {
    format!("presence:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (PresenceService, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = ExpiringCache::new(Duration::from_secs(300), Duration::from_secs(600));
        (PresenceService::new(db.clone(), cache), db)
    }

    #[tokio::test]
    async fn online_then_offline_is_visible_through_the_cache() {
        let (service, db) = service();
        let user = db.create_user("ada", None, None, "h").unwrap().id;
        let conn = Uuid::new_v4();

        service.set_online(user, conn).unwrap();
        let info = service.get_presence(user).unwrap().unwrap();
        assert_eq!(info.status, PresenceStatus::Online);
        assert_eq!(info.connections, vec![conn]);
        assert!(service.is_online(user).unwrap());

        service.set_offline(user).unwrap();
        let info = service.get_presence(user).unwrap().unwrap();
        assert_eq!(info.status, PresenceStatus::Offline);
        assert!(info.connections.is_empty());
        assert!(!service.is_online(user).unwrap());
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_the_store() {
        let (service, db) = service();
        let user = db.create_user("ada", None, None, "h").unwrap().id;

        // No session lifecycle has touched the cache yet; the store says
        // offline and the read must agree.
        let info = service.get_presence(user).unwrap().unwrap();
        assert_eq!(info.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn unknown_user_reads_as_absent() {
        let (service, _db) = service();
        assert!(service.get_presence(Uuid::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_read_mixes_cache_hits_and_store_fills() {
        let (service, db) = service();
        let a = db.create_user("ada", None, None, "h").unwrap().id;
        let b = db.create_user("grace", None, None, "h").unwrap().id;

        service.set_online(a, Uuid::new_v4()).unwrap();

        let result = service.get_multiple_presence(&[a, b]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[&a].status, PresenceStatus::Online);
        assert_eq!(result[&b].status, PresenceStatus::Offline);
    }
}
