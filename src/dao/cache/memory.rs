use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

use super::{
    CacheResult, ResponseAggregate, SNAPSHOT_TTL, SessionCache, SessionSnapshot, glob_matches,
    responses_key, snapshot_key,
};

#[derive(Clone)]
struct Expiring<T> {
    value: T,
    ttl: Duration,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            ttl,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Tables {
    snapshots: DashMap<String, Expiring<SessionSnapshot>>,
    responses: DashMap<String, Expiring<ResponseAggregate>>,
}

/// In-process TTL cache. Expired entries are invisible to readers and removed by
/// [`MemorySessionCache::spawn_reaper`].
#[derive(Clone, Default)]
pub struct MemorySessionCache {
    tables: Arc<Tables>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically drop expired entries until the cache itself is dropped.
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let tables = Arc::downgrade(&self.tables);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(tables) = tables.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let before = tables.snapshots.len() + tables.responses.len();
                tables.snapshots.retain(|_, entry| entry.is_live(now));
                tables.responses.retain(|_, entry| entry.is_live(now));
                let reaped = before - (tables.snapshots.len() + tables.responses.len());
                if reaped > 0 {
                    debug!(reaped, "expired cache entries removed");
                }
            }
        })
    }

    fn live_snapshot(&self, key: &str) -> Option<SessionSnapshot> {
        let entry = self.tables.snapshots.get(key)?;
        entry.is_live(Instant::now()).then(|| entry.value.clone())
    }
}

impl SessionCache for MemorySessionCache {
    fn put(
        &self,
        code: String,
        snapshot: SessionSnapshot,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>> {
        self.tables
            .snapshots
            .insert(snapshot_key(&code), Expiring::new(snapshot, ttl));
        Box::pin(async { Ok(()) })
    }

    fn get(&self, code: String) -> BoxFuture<'static, CacheResult<Option<SessionSnapshot>>> {
        let found = self.live_snapshot(&snapshot_key(&code));
        Box::pin(async move { Ok(found) })
    }

    fn update(
        &self,
        code: String,
        snapshot: SessionSnapshot,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let key = snapshot_key(&code);
        let now = Instant::now();
        let updated = match self.tables.snapshots.get_mut(&key) {
            Some(mut entry) if entry.is_live(now) => {
                let ttl = entry.ttl;
                *entry = Expiring::new(snapshot, ttl);
                true
            }
            _ => false,
        };
        Box::pin(async move { Ok(updated) })
    }

    fn scan(&self, pattern: String) -> BoxFuture<'static, CacheResult<Vec<String>>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .tables
            .snapshots
            .iter()
            .filter(|entry| entry.is_live(now) && glob_matches(&pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .chain(
                self.tables
                    .responses
                    .iter()
                    .filter(|entry| entry.is_live(now) && glob_matches(&pattern, entry.key()))
                    .map(|entry| entry.key().clone()),
            )
            .collect();
        keys.sort();
        Box::pin(async move { Ok(keys) })
    }

    fn delete(&self, code: String) -> BoxFuture<'static, CacheResult<()>> {
        let key = snapshot_key(&code);
        let prefix = format!("{key}:q:");
        self.tables.snapshots.remove(&key);
        self.tables
            .responses
            .retain(|candidate, _| !candidate.starts_with(&prefix));
        Box::pin(async { Ok(()) })
    }

    fn put_responses(
        &self,
        code: String,
        aggregate: ResponseAggregate,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let key = responses_key(&code, aggregate.question_order);
        // Aggregates live as long as their snapshot would.
        let ttl = self
            .tables
            .snapshots
            .get(&snapshot_key(&code))
            .map(|entry| entry.ttl)
            .unwrap_or(SNAPSHOT_TTL);
        self.tables
            .responses
            .insert(key, Expiring::new(aggregate, ttl));
        Box::pin(async { Ok(()) })
    }

    fn get_responses(
        &self,
        code: String,
        order: u32,
    ) -> BoxFuture<'static, CacheResult<Option<ResponseAggregate>>> {
        let now = Instant::now();
        let found = self
            .tables
            .responses
            .get(&responses_key(&code, order))
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        Box::pin(async move { Ok(found) })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::dao::{
        cache::OptionCount,
        models::{SessionConfig, SessionStatus},
    };

    fn snapshot(status: SessionStatus) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Uuid::new_v4(),
            quiz_id: Uuid::new_v4(),
            question_count: 3,
            current_question: 0,
            status,
            config: SessionConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemorySessionCache::new();
        cache
            .put("AB1234".into(), snapshot(SessionStatus::Idle), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(cache.get("AB1234".into()).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("AB1234".into()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_refreshes_ttl() {
        let cache = MemorySessionCache::new();
        cache
            .put("AB1234".into(), snapshot(SessionStatus::Idle), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(
            cache
                .update("AB1234".into(), snapshot(SessionStatus::Starting))
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(8)).await;

        let current = cache.get("AB1234".into()).await.unwrap().expect("still cached");
        assert_eq!(current.status, SessionStatus::Starting);
        assert!(
            !cache
                .update("ZZ0000".into(), snapshot(SessionStatus::Idle))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_drops_response_aggregates() {
        let cache = MemorySessionCache::new();
        cache
            .put("AB1234".into(), snapshot(SessionStatus::RevealingAnswer), SNAPSHOT_TTL)
            .await
            .unwrap();
        let aggregate = ResponseAggregate {
            question_order: 1,
            question_id: Uuid::new_v4(),
            total: 2,
            options: vec![OptionCount {
                option_id: Uuid::new_v4(),
                count: 2,
            }],
        };
        cache
            .put_responses("AB1234".into(), aggregate.clone())
            .await
            .unwrap();
        assert_eq!(
            cache.get_responses("AB1234".into(), 1).await.unwrap(),
            Some(aggregate)
        );
        assert_eq!(
            cache.scan("lqs:AB1234*".into()).await.unwrap(),
            vec!["lqs:AB1234".to_owned(), "lqs:AB1234:q:1".to_owned()]
        );

        cache.delete("AB1234".into()).await.unwrap();
        assert!(cache.get_responses("AB1234".into(), 1).await.unwrap().is_none());
        assert!(cache.scan("lqs:*".into()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_expired_entries() {
        let cache = MemorySessionCache::new();
        let reaper = cache.spawn_reaper(Duration::from_secs(1));
        cache
            .put("AB1234".into(), snapshot(SessionStatus::Idle), Duration::from_millis(500))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.tables.snapshots.is_empty());
        reaper.abort();
    }
}
