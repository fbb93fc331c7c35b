use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::time::TimeSource;

/// Where a value returned by [`TtlCache::get_or_load`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Hit,
    Miss,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Hit => "hit",
            CacheSource::Miss => "miss",
        }
    }
}

struct CachedValue<T> {
    value: T,
    loaded_at: DateTime<Utc>,
}

/// Single-value cache with a time-to-live, read through a loader.
///
/// The clock is injected so expiry can be tested without sleeping. Concurrent misses are
/// serialized: only one caller runs the loader and the others get its result. Loader errors
/// are returned to the caller and not cached.
pub struct TtlCache<T> {
    ttl: Duration,
    clock: Arc<dyn TimeSource + Send + Sync>,
    entry: Mutex<Option<CachedValue<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            ttl,
            clock,
            entry: Mutex::new(None),
        }
    }

    pub async fn get_or_load<F, Fut, E>(&self, loader: F) -> Result<(T, CacheSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut entry = self.entry.lock().await;

        if let Some(cached) = entry.as_ref() {
            // A clock that moved backwards counts as fresh.
            let age = self
                .clock
                .now()
                .signed_duration_since(cached.loaded_at)
                .to_std()
                .unwrap_or_default();

            if age < self.ttl {
                return Ok((cached.value.clone(), CacheSource::Hit));
            }
        }

        let value = loader().await?;
        *entry = Some(CachedValue {
            value: value.clone(),
            loaded_at: self.clock.now(),
        });

        Ok((value, CacheSource::Miss))
    }

    /// Drop the cached value so the next read goes to the loader.
    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::time::FixedTime;

    fn setup() -> (FixedTime, TtlCache<String>) {
        let clock = FixedTime::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
        let cache = TtlCache::new(Duration::from_secs(300), Arc::new(clock.clone()));
        (clock, cache)
    }

    async fn load(cache: &TtlCache<String>, calls: &AtomicUsize) -> (String, CacheSource) {
        cache
            .get_or_load(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(format!("load-{n}"))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_cached_value_within_ttl() {
        let (clock, cache) = setup();
        let calls = AtomicUsize::new(0);

        assert_eq!(load(&cache, &calls).await, ("load-0".to_owned(), CacheSource::Miss));

        clock.advance(chrono::Duration::seconds(299));
        assert_eq!(load(&cache, &calls).await, ("load-0".to_owned(), CacheSource::Hit));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reloads_after_ttl() {
        let (clock, cache) = setup();
        let calls = AtomicUsize::new(0);

        load(&cache, &calls).await;
        clock.advance(chrono::Duration::seconds(300));

        assert_eq!(load(&cache, &calls).await, ("load-1".to_owned(), CacheSource::Miss));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (_clock, cache) = setup();
        let calls = AtomicUsize::new(0);

        load(&cache, &calls).await;
        cache.invalidate().await;

        assert_eq!(load(&cache, &calls).await, ("load-1".to_owned(), CacheSource::Miss));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let (_clock, cache) = setup();

        let failed = cache
            .get_or_load(|| async { Err::<String, _>("database is down") })
            .await;
        assert_eq!(failed, Err("database is down"));

        let loaded = cache
            .get_or_load(|| async { Ok::<_, &str>("fresh".to_owned()) })
            .await;
        assert_eq!(loaded, Ok(("fresh".to_owned(), CacheSource::Miss)));
    }
}
