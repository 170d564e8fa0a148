use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_core::Clock;
use tokio::sync::Mutex;

use super::{BucketState, SharedStore, StoreError, StoreResult, TokenBucket};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Process-local [`SharedStore`] guarded by a single mutex.
///
/// Expiry is evaluated against the injected clock so tests can age keys with
/// `TestClock::advance`. Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemorySharedStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl InMemorySharedStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`]
    /// until reset. Used to exercise degraded paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().await.values().filter(|e| !is_expired(e, now)).count()
    }

    /// Whether the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| self.clock.now() + ttl)
    }
}

fn is_expired(entry: &Entry, now: Instant) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

/// Returns the live entry at `key`, evicting it first if expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| is_expired(e, now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::corrupt(key, "operation against a key holding the wrong kind of value")
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Text(text), .. }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let entry = Entry { value: Value::Text(value.to_string()), expires_at: self.expiry(ttl) };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        let entry = Entry { value: Value::Text(value.to_string()), expires_at: self.expiry(ttl) };
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let current = match live(&mut entries, key, now) {
            None => None,
            Some(Entry { value: Value::Text(text), .. }) => Some(text.as_str()),
            Some(_) => return Err(wrong_type(key)),
        };
        if current != expected {
            return Ok(false);
        }
        let entry = Entry { value: Value::Text(new.to_string()), expires_at: self.expiry(ttl) };
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key, now) {
            let Value::Text(text) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let current: i64 =
                text.parse().map_err(|_| StoreError::corrupt(key, "counter is not an integer"))?;
            let next = current.saturating_add(1);
            *text = next.to_string();
            return Ok(next);
        }
        let entry = Entry { value: Value::Text("1".to_string()), expires_at: self.expiry(ttl) };
        entries.insert(key.to_string(), entry);
        Ok(1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn push(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key, now) {
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            list.push_back(value.to_string());
            return Ok(list.len());
        }
        let entry = Entry { value: Value::List(VecDeque::from([value.to_string()])), expires_at: None };
        entries.insert(key.to_string(), entry);
        Ok(1)
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            None => return Ok(Vec::new()),
            Some(Entry { value: Value::List(_), .. }) => {},
            Some(_) => return Err(wrong_type(key)),
        }
        match entries.remove(key) {
            Some(Entry { value: Value::List(list), .. }) => Ok(list.into()),
            _ => Ok(Vec::new()),
        }
    }

    async fn restore(&self, key: &str, values: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key, now) {
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            for value in values.iter().rev() {
                list.push_front(value.clone());
            }
            return Ok(list.len());
        }
        if values.is_empty() {
            return Ok(0);
        }
        let entry = Entry { value: Value::List(values.iter().cloned().collect()), expires_at: None };
        entries.insert(key.to_string(), entry);
        Ok(values.len())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn take_tokens(&self, key: &str, bucket: TokenBucket, now_ms: i64) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let previous = match live(&mut entries, key, now) {
            None => None,
            Some(Entry { value: Value::Text(text), .. }) => Some(
                serde_json::from_str::<BucketState>(text)
                    .map_err(|e| StoreError::corrupt(key, e.to_string()))?,
            ),
            Some(_) => return Err(wrong_type(key)),
        };

        let (state, allowed) = BucketState::refill_and_take(previous, bucket, now_ms);
        let encoded =
            serde_json::to_string(&state).map_err(|e| StoreError::corrupt(key, e.to_string()))?;
        let entry = Entry { value: Value::Text(encoded), expires_at: self.expiry(Some(bucket.idle_ttl())) };
        entries.insert(key.to_string(), entry);
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn store() -> (InMemorySharedStore, TestClock) {
        let clock = TestClock::new();
        (InMemorySharedStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn set_if_absent_respects_existing_and_expired_keys() {
        let (store, clock) = store();

        assert!(store.set_if_absent("k", "a", Some(Duration::from_secs(10))).await.unwrap());
        assert!(!store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "c", None).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_requires_expected_value() {
        let (store, _) = store();

        assert!(store.compare_and_swap("s", None, "closed", None).await.unwrap());
        assert!(!store.compare_and_swap("s", None, "open", None).await.unwrap());
        assert!(!store.compare_and_swap("s", Some("open"), "half", None).await.unwrap());
        assert!(store.compare_and_swap("s", Some("closed"), "open", None).await.unwrap());
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("open"));
    }

    #[tokio::test]
    async fn increment_ttl_applies_on_creation_only() {
        let (store, clock) = store();
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(store.increment("c", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(40));
        assert_eq!(store.increment("c", ttl).await.unwrap(), 2);
        clock.advance(Duration::from_secs(20));
        assert_eq!(store.increment("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lists_preserve_order_and_drain_atomically() {
        let (store, _) = store();

        assert_eq!(store.push("l", "a").await.unwrap(), 1);
        assert_eq!(store.push("l", "b").await.unwrap(), 2);
        assert_eq!(store.range("l").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.drain("l").await.unwrap(), vec!["a", "b"]);
        assert!(store.drain("l").await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn restore_puts_values_ahead_of_newer_pushes() {
        let (store, _) = store();
        store.push("l", "a").await.unwrap();
        store.push("l", "b").await.unwrap();
        let drained = store.drain("l").await.unwrap();
        store.push("l", "c").await.unwrap();

        assert_eq!(store.restore("l", &drained).await.unwrap(), 3);
        assert_eq!(store.range("l").await.unwrap(), vec!["a", "b", "c"]);

        assert_eq!(store.restore("empty", &[]).await.unwrap(), 0);
        assert!(store.range("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let (store, _) = store();
        store.set("k", "text", None).await.unwrap();
        assert!(matches!(store.push("k", "x").await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn keys_with_prefix_lists_live_keys() {
        let (store, _) = store();
        store.push("batch:a", "1").await.unwrap();
        store.push("batch:b", "1").await.unwrap();
        store.set("circuit:a:state", "{}", None).await.unwrap();

        assert_eq!(store.keys_with_prefix("batch:").await.unwrap(), vec!["batch:a", "batch:b"]);
    }

    #[tokio::test]
    async fn take_tokens_refills_with_time() {
        let (store, clock) = store();
        let bucket = TokenBucket { capacity: 2.0, refill_per_second: 1.0, cost: 1.0 };

        let now = clock.unix_millis();
        assert!(store.take_tokens("rl", bucket, now).await.unwrap());
        assert!(store.take_tokens("rl", bucket, now).await.unwrap());
        assert!(!store.take_tokens("rl", bucket, now).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(store.take_tokens("rl", bucket, clock.unix_millis()).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, _) = store();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable { .. })));
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }
}
