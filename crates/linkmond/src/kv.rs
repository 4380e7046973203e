//! Key-value store client handle.
//!
//! The routing KV store is an external collaborator; the monitor talks to it
//! through the narrow [`KvStoreClient`] trait. Keys the daemon persists are
//! "sticky": the client remembers them and re-sets them on TTL refresh so
//! the daemon keeps owning its entries across transient disconnects.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{LinkMonitorError, Result};

/// Narrow handle to the routing key-value store, scoped by area.
#[async_trait]
pub trait KvStoreClient: Send {
    /// Sets a key the daemon owns; refreshed on every TTL cycle until the
    /// client is closed.
    async fn persist_key(&mut self, area: &str, key: &str, value: String, ttl: Duration)
        -> Result<()>;

    /// Reads a key, None when absent.
    async fn get_key(&mut self, area: &str, key: &str) -> Result<Option<String>>;

    /// Lists (key, value) pairs under a key prefix within an area.
    async fn scan_prefix(&mut self, area: &str, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Re-persists every owned key with a fresh TTL.
    async fn refresh_owned(&mut self, ttl: Duration) -> Result<()>;

    /// Releases the client; owned keys are left to expire at their TTL.
    async fn close(&mut self) -> Result<()>;
}

fn scoped_key(area: &str, key: &str) -> String {
    format!("{}|{}", area, key)
}

fn unscoped_key(key: &str) -> String {
    key.split_once('|')
        .map(|(_, k)| k.to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Redis-backed KV store client.
pub struct RedisKvStore {
    conn: redis::aio::MultiplexedConnection,
    /// Owned (persisted) keys with their last written values
    owned: BTreeMap<String, String>,
}

impl RedisKvStore {
    /// Connects to the KV store.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| LinkMonitorError::KvStore(format!("invalid KV url {}: {}", url, e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LinkMonitorError::KvStore(format!("cannot connect to {}: {}", url, e)))?;
        debug!(host, port, "Connected to KV store");
        Ok(Self {
            conn,
            owned: BTreeMap::new(),
        })
    }

    async fn set_with_ttl(&mut self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut self.conn)
            .await
            .map_err(|e| LinkMonitorError::KvStore(format!("SET {} failed: {}", key, e)))
    }
}

#[async_trait]
impl KvStoreClient for RedisKvStore {
    async fn persist_key(
        &mut self,
        area: &str,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<()> {
        let scoped = scoped_key(area, key);
        self.set_with_ttl(&scoped, &value, ttl).await?;
        self.owned.insert(scoped, value);
        Ok(())
    }

    async fn get_key(&mut self, area: &str, key: &str) -> Result<Option<String>> {
        let scoped = scoped_key(area, key);
        redis::cmd("GET")
            .arg(&scoped)
            .query_async::<_, Option<String>>(&mut self.conn)
            .await
            .map_err(|e| LinkMonitorError::KvStore(format!("GET {} failed: {}", scoped, e)))
    }

    async fn scan_prefix(&mut self, area: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = format!("{}*", scoped_key(area, prefix));
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| LinkMonitorError::KvStore(format!("KEYS {} failed: {}", pattern, e)))?;

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut self.conn)
                .await
                .map_err(|e| LinkMonitorError::KvStore(format!("GET {} failed: {}", key, e)))?;
            if let Some(value) = value {
                pairs.push((unscoped_key(&key), value));
            }
        }
        Ok(pairs)
    }

    async fn refresh_owned(&mut self, ttl: Duration) -> Result<()> {
        let owned: Vec<(String, String)> = self
            .owned
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in owned {
            if let Err(e) = self.set_with_ttl(&key, &value, ttl).await {
                warn!(key, error = %e, "TTL refresh failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.owned.clear();
        Ok(())
    }
}

/// In-memory KV store for tests.
#[derive(Debug, Default)]
pub struct MemKvStore {
    entries: BTreeMap<String, String>,
    owned: HashSet<String>,
    /// Number of persist_key calls served
    pub persist_count: usize,
    /// When set, every persist fails until the flag is cleared
    pub fail_persists: bool,
    closed: bool,
}

impl MemKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an entry directly (test assertions).
    pub fn entry(&self, area: &str, key: &str) -> Option<&String> {
        self.entries.get(&scoped_key(area, key))
    }

    /// Inserts an entry directly (test setup), bypassing ownership.
    pub fn seed(&mut self, area: &str, key: &str, value: impl Into<String>) {
        self.entries.insert(scoped_key(area, key), value.into());
    }

    /// True after close().
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn do_persist(&mut self, area: &str, key: &str, value: String) -> Result<()> {
        if self.fail_persists {
            return Err(LinkMonitorError::KvStore(
                "injected persist failure".to_string(),
            ));
        }
        let scoped = scoped_key(area, key);
        self.entries.insert(scoped.clone(), value);
        self.owned.insert(scoped);
        self.persist_count += 1;
        Ok(())
    }

    fn do_get(&self, area: &str, key: &str) -> Option<String> {
        self.entries.get(&scoped_key(area, key)).cloned()
    }

    fn do_scan(&self, area: &str, prefix: &str) -> Vec<(String, String)> {
        let scoped_prefix = scoped_key(area, prefix);
        self.entries
            .range(scoped_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&scoped_prefix))
            .map(|(k, v)| (unscoped_key(k), v.clone()))
            .collect()
    }

    fn do_close(&mut self) {
        self.closed = true;
    }
}

#[async_trait]
impl KvStoreClient for MemKvStore {
    async fn persist_key(
        &mut self,
        area: &str,
        key: &str,
        value: String,
        _ttl: Duration,
    ) -> Result<()> {
        self.do_persist(area, key, value)
    }

    async fn get_key(&mut self, area: &str, key: &str) -> Result<Option<String>> {
        Ok(self.do_get(area, key))
    }

    async fn scan_prefix(&mut self, area: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self.do_scan(area, prefix))
    }

    async fn refresh_owned(&mut self, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.do_close();
        Ok(())
    }
}

/// Cloneable view over a [`MemKvStore`], letting a test keep eyes on a store
/// whose other handle was moved into the monitor.
#[derive(Debug, Default, Clone)]
pub struct SharedKvStore {
    inner: Arc<Mutex<MemKvStore>>,
}

impl SharedKvStore {
    /// Creates an empty shared store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a closure against the underlying store.
    pub fn with<R>(&self, f: impl FnOnce(&mut MemKvStore) -> R) -> R {
        f(&mut self.inner.lock().expect("kv store mutex poisoned"))
    }
}

#[async_trait]
impl KvStoreClient for SharedKvStore {
    async fn persist_key(
        &mut self,
        area: &str,
        key: &str,
        value: String,
        _ttl: Duration,
    ) -> Result<()> {
        self.with(|kv| kv.do_persist(area, key, value))
    }

    async fn get_key(&mut self, area: &str, key: &str) -> Result<Option<String>> {
        Ok(self.with(|kv| kv.do_get(area, key)))
    }

    async fn scan_prefix(&mut self, area: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self.with(|kv| kv.do_scan(area, prefix)))
    }

    async fn refresh_owned(&mut self, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.with(|kv| kv.do_close());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_kv_persist_and_get() {
        let mut kv = MemKvStore::new();
        kv.persist_key("0", "adj:N1", "db".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            kv.get_key("0", "adj:N1").await.unwrap(),
            Some("db".to_string())
        );
        assert_eq!(kv.get_key("1", "adj:N1").await.unwrap(), None);
        assert_eq!(kv.persist_count, 1);
    }

    #[tokio::test]
    async fn test_mem_kv_scan_prefix() {
        let mut kv = MemKvStore::new();
        kv.seed("0", "nodeLabel:101", "N1");
        kv.seed("0", "nodeLabel:102", "N2");
        kv.seed("0", "adj:N1", "db");
        kv.seed("1", "nodeLabel:101", "N3");

        let pairs = kv.scan_prefix("0", "nodeLabel:").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("nodeLabel:101".to_string(), "N1".to_string()));
    }

    #[tokio::test]
    async fn test_mem_kv_injected_failure() {
        let mut kv = MemKvStore::new();
        kv.fail_persists = true;
        assert!(kv
            .persist_key("0", "adj:N1", "db".to_string(), Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(kv.entry("0", "adj:N1"), None);
    }

    #[tokio::test]
    async fn test_shared_kv_views_same_store() {
        let shared = SharedKvStore::new();
        let mut handle = shared.clone();
        handle
            .persist_key("0", "adj:N1", "db".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            shared.with(|kv| kv.entry("0", "adj:N1").cloned()),
            Some("db".to_string())
        );
    }

    #[tokio::test]
    async fn test_mem_kv_close() {
        let mut kv = MemKvStore::new();
        kv.close().await.unwrap();
        assert!(kv.is_closed());
    }
}
