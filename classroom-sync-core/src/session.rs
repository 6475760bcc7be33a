//! Memoizing cache for values that are expensive to build and cheap to share.
//!
//! Each key gets its own [`OnceCell`], so concurrent callers asking for the same key
//! wait on a single initialization instead of racing to build duplicates. A failed
//! initialization leaves the slot empty and the next caller tries again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

#[derive(Debug)]
pub struct SessionCache<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SessionCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SessionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, building it with `init` on first use.
    pub async fn get_or_try_init<E, F, Fut>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_try_init(init).await.cloned()
    }

    /// Cached value for `key`, if one has been built.
    pub async fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().await;
        slots.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Store a value up front, e.g. to pre-populate before a fan-out.
    pub async fn insert(&self, key: K, value: V) {
        let mut slots = self.slots.lock().await;
        slots.insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|cell| cell.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_initialization() {
        let cache: Arc<SessionCache<String, String>> = Arc::new(SessionCache::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_init(&"t100".to_string(), || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("t100@example.edu".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "t100@example.edu");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failed_initialization_is_retried() {
        let cache: SessionCache<u32, u32> = SessionCache::new();
        let first: Result<u32, &str> = cache.get_or_try_init(&1, || async { Err("offline") }).await;
        assert_eq!(first, Err("offline"));
        assert_eq!(cache.get(&1).await, None);

        let second: Result<u32, &str> = cache.get_or_try_init(&1, || async { Ok(42) }).await;
        assert_eq!(second, Ok(42));
        assert_eq!(cache.get(&1).await, Some(42));
    }

    #[tokio::test]
    async fn inserted_values_are_served_without_init() {
        let cache: SessionCache<&'static str, u8> = SessionCache::new();
        cache.insert("k", 7).await;
        let value: Result<u8, ()> = cache
            .get_or_try_init(&"k", || async { Ok(99) })
            .await;
        assert_eq!(value, Ok(7));
    }
}
