//! Redis-backed cache: keyed values plus the newest-first audit log.
//!
//! The cache is best-effort for instance snapshots, but authoritative for the
//! operator-visible audit log (bounded by a 48h sliding TTL). An in-memory
//! backend with the same key/list/TTL semantics backs the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use flashboard_common::{Config, Error, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrency-safe cache handle. Cloning shares the underlying backend.
#[derive(Clone)]
pub struct Cache {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Memory(Arc<Mutex<MemoryStore>>),
}

impl Cache {
    /// Connect to Redis, retrying the initial handshake. Exhausting the
    /// retries is a fatal startup error for the caller.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let client = redis::Client::open(cfg.redis_url())?;
        let mut last_err: Option<Error> = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
                .await
            {
                Ok(Ok(con)) => {
                    info!("connected to redis at {}", cfg.redis_url());
                    return Ok(Self {
                        backend: Backend::Redis(con),
                    });
                }
                Ok(Err(e)) => {
                    warn!("redis connection attempt {attempt} failed: {e}");
                    last_err = Some(e.into());
                }
                Err(_) => {
                    warn!("redis connection attempt {attempt} timed out");
                    last_err = Some(Error::Internal("redis connection timed out".to_string()));
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Internal(format!(
                "failed to connect to redis after {CONNECT_ATTEMPTS} attempts"
            ))
        }))
    }

    /// In-memory cache with the same semantics, for tests.
    pub fn open_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryStore::default()))),
        }
    }

    /// Store the JSON encoding of `value` with no TTL. Best effort: failures
    /// are logged and swallowed.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let data = match serde_json::to_string(value) {
            Ok(d) => d,
            Err(e) => {
                warn!("failed to encode value for cache key {key}: {e}");
                return;
            }
        };
        if let Err(e) = self.set_raw(key, data).await {
            warn!("failed to set cache key {key}: {e}");
        }
    }

    /// Prepend a JSON-encoded entry to the log at `key`. Best effort.
    pub async fn push<T: Serialize>(&self, key: &str, entry: &T) {
        let data = match serde_json::to_string(entry) {
            Ok(d) => d,
            Err(e) => {
                warn!("failed to encode entry for cache list {key}: {e}");
                return;
            }
        };
        let result = match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.lpush::<_, _, ()>(key, data).await.map_err(Error::from)
            }
            Backend::Memory(mem) => {
                lock(mem).lpush(key, data);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("failed to push to cache list {key}: {e}");
        }
    }

    /// Entries of the log at `key`, newest first. A missing key, a redis
    /// error or an undecodable entry never surfaces to the caller.
    pub async fn range<T: DeserializeOwned>(&self, key: &str, start: isize, stop: isize) -> Vec<T> {
        let items: Vec<String> = match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                match con.lrange(key, start, stop).await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!("failed to read cache list {key}: {e}");
                        return Vec::new();
                    }
                }
            }
            Backend::Memory(mem) => lock(mem).lrange(key, start, stop),
        };
        decode_entries(&items)
    }

    /// Set an absolute TTL from now. Best effort.
    pub async fn expire(&self, key: &str, dur: Duration) {
        let result = match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.expire::<_, ()>(key, dur.as_secs() as i64)
                    .await
                    .map_err(Error::from)
            }
            Backend::Memory(mem) => {
                lock(mem).expire(key, dur);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("failed to set expiration on cache key {key}: {e}");
        }
    }

    /// Remaining TTL for a key; `None` when the key is absent or has none.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                let secs: i64 = con.ttl(key).await?;
                Ok(u64::try_from(secs).ok().map(Duration::from_secs))
            }
            Backend::Memory(mem) => Ok(lock(mem).ttl(key)),
        }
    }

    /// Fetch and decode a keyed record. Errors surface to the caller; the
    /// identity and session stores depend on them.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let data = match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.get::<_, Option<String>>(key).await?
            }
            Backend::Memory(mem) => lock(mem).get(key),
        };
        match data {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    /// Store a keyed record with no TTL.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        self.set_raw(key, data).await
    }

    /// Store a raw value with a TTL in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
            }
            Backend::Memory(mem) => {
                lock(mem).set_ex(key, value.to_string(), Duration::from_secs(ttl_secs));
            }
        }
        Ok(())
    }

    /// Whether a key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                Ok(con.exists(key).await?)
            }
            Backend::Memory(mem) => Ok(lock(mem).get_entry(key).is_some()),
        }
    }

    /// Delete a key.
    pub async fn del(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.del::<_, ()>(key).await?;
            }
            Backend::Memory(mem) => {
                lock(mem).del(key);
            }
        }
        Ok(())
    }

    /// Keys matching a pattern. Fine at this scale: the user namespace holds
    /// a handful of records.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                Ok(con.keys(pattern).await?)
            }
            Backend::Memory(mem) => Ok(lock(mem).keys(pattern)),
        }
    }

    async fn set_raw(&self, key: &str, data: String) -> Result<()> {
        match &self.backend {
            Backend::Redis(con) => {
                let mut con = con.clone();
                con.set::<_, _, ()>(key, data).await?;
            }
            Backend::Memory(mem) => {
                lock(mem).set(key, data);
            }
        }
        Ok(())
    }
}

/// Decode a batch of JSON entries, skipping any that fail to parse.
fn decode_entries<T: DeserializeOwned>(items: &[String]) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_str(item) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("skipping undecodable cache entry: {e}");
                None
            }
        })
        .collect()
}

fn lock(mem: &Mutex<MemoryStore>) -> std::sync::MutexGuard<'_, MemoryStore> {
    mem.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct MemoryStore {
    entries: HashMap<String, MemoryEntry>,
}

struct MemoryEntry {
    data: MemoryValue,
    expires_at: Option<Instant>,
}

enum MemoryValue {
    Value(String),
    List(Vec<String>),
}

impl MemoryStore {
    /// Entry at `key`, dropping it first if its TTL has lapsed.
    fn get_entry(&mut self, key: &str) -> Option<&mut MemoryEntry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|t| t <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        match self.get_entry(key) {
            Some(MemoryEntry {
                data: MemoryValue::Value(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        }
    }

    // SET semantics: replaces the entry and clears any TTL.
    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: MemoryValue::Value(value),
                expires_at: None,
            },
        );
    }

    fn set_ex(&mut self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: MemoryValue::Value(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    // LPUSH preserves the TTL of an existing list.
    fn lpush(&mut self, key: &str, value: String) {
        match self.get_entry(key) {
            Some(entry) => match &mut entry.data {
                MemoryValue::List(items) => items.insert(0, value),
                MemoryValue::Value(_) => {
                    entry.data = MemoryValue::List(vec![value]);
                }
            },
            None => {
                self.entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        data: MemoryValue::List(vec![value]),
                        expires_at: None,
                    },
                );
            }
        }
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let items = match self.get_entry(key) {
            Some(MemoryEntry {
                data: MemoryValue::List(items),
                ..
            }) => items,
            _ => return Vec::new(),
        };
        let len = items.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        let s = norm(start).max(0);
        let e = norm(stop).min(len - 1);
        if len == 0 || s > e {
            return Vec::new();
        }
        items[s as usize..=e as usize].to_vec()
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.get_entry(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn ttl(&mut self, key: &str) -> Option<Duration> {
        self.get_entry(key)
            .and_then(|e| e.expires_at)
            .and_then(|t| t.checked_duration_since(Instant::now()))
    }

    fn del(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&mut self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |t| t > now))
            .map(|(k, _)| k.clone())
            .filter(|k| pattern_matches(pattern, k))
            .collect()
    }
}

/// Exact match, or prefix match for a trailing `*` (the only glob shape the
/// backend uses).
fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashboard_common::LogEntry;

    #[test]
    fn test_decode_entries_skips_garbage() {
        let items = vec![
            r#"{"timestamp":2,"message":"b","type":"rollout"}"#.to_string(),
            "not json".to_string(),
            r#"{"timestamp":1,"message":"a","type":"info"}"#.to_string(),
        ];
        let entries: Vec<LogEntry> = decode_entries(&items);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, 2);
        assert_eq!(entries[1].kind, "info");
    }

    #[test]
    fn test_decode_entries_empty() {
        let entries: Vec<LogEntry> = decode_entries(&[]);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_memory_record_round_trip() {
        let cache = Cache::open_memory();
        let entry = LogEntry {
            timestamp: 1,
            message: "m".to_string(),
            kind: "info".to_string(),
        };
        cache.set_json("k", &entry).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
        let back: Option<LogEntry> = cache.get_json("k").await.unwrap();
        assert_eq!(back.unwrap(), entry);

        cache.del("k").await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_list_is_newest_first() {
        let cache = Cache::open_memory();
        for ts in 1..=3 {
            let entry = LogEntry {
                timestamp: ts,
                message: format!("m{ts}"),
                kind: "info".to_string(),
            };
            cache.push("logs", &entry).await;
        }
        let entries: Vec<LogEntry> = cache.range("logs", 0, -1).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp, 3);
        assert_eq!(entries[2].timestamp, 1);
    }

    #[tokio::test]
    async fn test_memory_ttl_expires_keys() {
        let cache = Cache::open_memory();
        cache.set_ex("s", "1", 3600).await.unwrap();
        let ttl = cache.ttl("s").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl > Duration::from_secs(3590));

        // A lapsed TTL makes the key invisible.
        cache.expire("s", Duration::from_secs(0)).await;
        assert!(!cache.exists("s").await.unwrap());
        assert!(cache.ttl("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_keys_pattern() {
        let cache = Cache::open_memory();
        cache.set_json("user:admin", &1).await.unwrap();
        cache.set_json("user:bob", &2).await.unwrap();
        cache.set_json("session:user:1:t", &1).await.unwrap();
        let mut keys = cache.keys("user:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:admin", "user:bob"]);
    }
}
