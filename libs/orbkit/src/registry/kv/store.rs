//! Key-value store abstraction and its in-process implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use orbkit_errors::OrbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    /// First write of a key.
    Create,
    /// Any later write, including one with an unchanged value.
    Update,
    Delete,
    Purge,
}

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct KvEvent {
    pub operation: KvOperation,
    pub key: String,
    /// `None` for deletes and purges.
    pub value: Option<Bytes>,
}

/// A live subscription to changes below a key prefix.
///
/// Dropping it unsubscribes.
pub struct KvWatch {
    rx: mpsc::Receiver<KvEvent>,
}

impl KvWatch {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<KvEvent>) -> Self {
        Self { rx }
    }

    /// The next change, `None` once the store closed the subscription.
    pub async fn recv(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Minimal bucketed key-value contract the KV registry runs on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `value` under `key`, returning the new revision.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<u64, OrbError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, OrbError>;

    /// Removes `key`, leaving a delete marker for watchers.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), OrbError>;

    /// Removes `key` and its history.
    async fn purge(&self, bucket: &str, key: &str) -> Result<(), OrbError>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, OrbError>;

    async fn watch(&self, bucket: &str, prefix: &str) -> Result<KvWatch, OrbError>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    revision: u64,
    expires_at: Option<Instant>,
}

struct Subscriber {
    bucket: String,
    prefix: String,
    tx: mpsc::Sender<KvEvent>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, Slot>>,
    subscribers: Vec<Subscriber>,
    revision: u64,
}

impl Inner {
    fn expire(&mut self, bucket: &str, now: Instant) -> Vec<String> {
        let Some(entries) = self.buckets.get_mut(bucket) else {
            return Vec::new();
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
    }

    fn expire_all(&mut self, now: Instant) -> Vec<(String, Vec<String>)> {
        let buckets: Vec<String> = self.buckets.keys().cloned().collect();
        buckets
            .into_iter()
            .filter_map(|bucket| {
                let expired = self.expire(&bucket, now);
                (!expired.is_empty()).then_some((bucket, expired))
            })
            .collect()
    }

    fn targets(&mut self, bucket: &str, key: &str) -> Vec<mpsc::Sender<KvEvent>> {
        self.subscribers.retain(|s| !s.tx.is_closed());
        self.subscribers
            .iter()
            .filter(|s| s.bucket == bucket && key.starts_with(&s.prefix))
            .map(|s| s.tx.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryKvConfig {
    /// How long an event send to one watcher may block before the event is
    /// dropped for that watcher.
    #[serde(with = "humantime_serde")]
    pub watcher_send_timeout: Duration,
    /// Per-watcher event buffer.
    pub watcher_buffer: usize,
    /// How often entries with a lapsed TTL are removed.
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for MemoryKvConfig {
    fn default() -> Self {
        Self {
            watcher_send_timeout: Duration::from_millis(10),
            watcher_buffer: 256,
            reap_interval: Duration::from_millis(100),
        }
    }
}

struct Shared {
    config: MemoryKvConfig,
    inner: Mutex<Inner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// A [`KeyValueStore`] living in process memory.
///
/// Clones share the same data. Entries written with a TTL disappear once it
/// lapses, and the removal is reported to watchers as a delete. A watcher
/// that does not keep up misses events instead of stalling writers.
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    shared: Arc<Shared>,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::with_config(MemoryKvConfig::default())
    }
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: MemoryKvConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner::default()),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Runs the reaper on the caller's runtime unless one is alive.
    fn ensure_reaper(&self) {
        let mut reaper = self.shared.reaper.lock();
        if reaper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        *reaper = Some(handle.spawn(reap_loop(weak, self.shared.config.reap_interval)));
    }

    async fn notify(&self, bucket: &str, events: Vec<KvEvent>) {
        notify(&self.shared, bucket, events).await;
    }

    async fn reap(&self, bucket: &str) {
        let expired = self.shared.inner.lock().expire(bucket, Instant::now());
        if !expired.is_empty() {
            self.notify(bucket, deletes(expired)).await;
        }
    }

    async fn remove(&self, bucket: &str, key: &str, operation: KvOperation) {
        let existed = {
            let mut inner = self.shared.inner.lock();
            inner
                .buckets
                .get_mut(bucket)
                .and_then(|b| b.remove(key))
                .is_some()
        };
        if existed {
            let event = KvEvent {
                operation,
                key: key.to_owned(),
                value: None,
            };
            self.notify(bucket, vec![event]).await;
        }
    }
}

fn deletes(keys: Vec<String>) -> Vec<KvEvent> {
    keys.into_iter()
        .map(|key| KvEvent {
            operation: KvOperation::Delete,
            key,
            value: None,
        })
        .collect()
}

async fn notify(shared: &Shared, bucket: &str, events: Vec<KvEvent>) {
    let timeout = shared.config.watcher_send_timeout;
    for event in events {
        let targets = shared.inner.lock().targets(bucket, &event.key);
        for tx in targets {
            match tx.send_timeout(event.clone(), timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::debug!(key = %event.key, "kv watcher too slow, event dropped");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    tracing::trace!(key = %event.key, "kv watcher gone");
                }
            }
        }
    }
}

async fn reap_loop(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let expired = shared.inner.lock().expire_all(Instant::now());
        for (bucket, keys) in expired {
            tracing::debug!(%bucket, keys = keys.len(), "kv entries expired");
            notify(&shared, &bucket, deletes(keys)).await;
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<u64, OrbError> {
        if key.is_empty() {
            return Err(OrbError::BAD_REQUEST.wrap("empty key"));
        }
        if ttl.is_some() {
            self.ensure_reaper();
        }
        let (revision, operation) = {
            let mut inner = self.shared.inner.lock();
            inner.revision += 1;
            let revision = inner.revision;
            let slot = Slot {
                value: value.clone(),
                revision,
                expires_at: ttl.map(|t| Instant::now() + t),
            };
            let previous = inner
                .buckets
                .entry(bucket.to_owned())
                .or_default()
                .insert(key.to_owned(), slot);
            let operation = if previous.is_some() {
                KvOperation::Update
            } else {
                KvOperation::Create
            };
            (revision, operation)
        };
        let event = KvEvent {
            operation,
            key: key.to_owned(),
            value: Some(value),
        };
        self.notify(bucket, vec![event]).await;
        Ok(revision)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, OrbError> {
        self.reap(bucket).await;
        let inner = self.shared.inner.lock();
        Ok(inner
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|slot| KvEntry {
                key: key.to_owned(),
                value: slot.value.clone(),
                revision: slot.revision,
            }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), OrbError> {
        self.remove(bucket, key, KvOperation::Delete).await;
        Ok(())
    }

    async fn purge(&self, bucket: &str, key: &str) -> Result<(), OrbError> {
        self.remove(bucket, key, KvOperation::Purge).await;
        Ok(())
    }

    async fn keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, OrbError> {
        self.reap(bucket).await;
        let inner = self.shared.inner.lock();
        Ok(inner
            .buckets
            .get(bucket)
            .map(|b| {
                b.range(prefix.to_owned()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(&self, bucket: &str, prefix: &str) -> Result<KvWatch, OrbError> {
        self.ensure_reaper();
        let (tx, rx) = mpsc::channel(self.shared.config.watcher_buffer.max(1));
        self.shared.inner.lock().subscribers.push(Subscriber {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(KvWatch::new(rx))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_reports_create_then_update() {
        let store = MemoryKeyValueStore::new();
        let mut watch = store.watch("b", "").await.unwrap();

        store.put("b", "k", Bytes::from_static(b"1"), None).await.unwrap();
        store.put("b", "k", Bytes::from_static(b"1"), None).await.unwrap();
        store.purge("b", "k").await.unwrap();

        let ops: Vec<_> = [
            watch.recv().await.unwrap(),
            watch.recv().await.unwrap(),
            watch.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.operation)
        .collect();
        assert_eq!(
            ops,
            vec![KvOperation::Create, KvOperation::Update, KvOperation::Purge]
        );
    }

    #[tokio::test]
    async fn test_keys_respects_bucket_and_prefix() {
        let store = MemoryKeyValueStore::new();
        for key in ["foo@1@v1", "foo@2@v1", "foobar@3@v1"] {
            store.put("b", key, Bytes::new(), None).await.unwrap();
        }
        store.put("other", "foo@9@v1", Bytes::new(), None).await.unwrap();

        assert_eq!(store.keys("b", "foo@").await.unwrap(), vec!["foo@1@v1", "foo@2@v1"]);
        assert_eq!(store.keys("b", "").await.unwrap().len(), 3);
        assert!(store.keys("missing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_entries_expire_on_read() {
        let store = MemoryKeyValueStore::new();
        let mut watch = store.watch("b", "k").await.unwrap();
        store
            .put("b", "k", Bytes::from_static(b"v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap().operation, KvOperation::Create);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("b", "k").await.unwrap().is_none());
        assert_eq!(watch.recv().await.unwrap().operation, KvOperation::Delete);
    }

    #[tokio::test]
    async fn test_expiry_is_reported_without_reads() {
        let store = MemoryKeyValueStore::with_config(MemoryKvConfig {
            reap_interval: Duration::from_millis(10),
            ..MemoryKvConfig::default()
        });
        let mut watch = store.watch("b", "").await.unwrap();
        store
            .put("b", "k", Bytes::from_static(b"v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap().operation, KvOperation::Create);

        let deleted = tokio::time::timeout(Duration::from_secs(2), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.operation, KvOperation::Delete);
        assert_eq!(deleted.key, "k");
    }

    #[tokio::test]
    async fn test_full_watcher_drops_instead_of_blocking() {
        let store = MemoryKeyValueStore::with_config(MemoryKvConfig {
            watcher_buffer: 2,
            ..MemoryKvConfig::default()
        });
        let mut watch = store.watch("b", "").await.unwrap();
        let writes = async {
            for i in 0..10 {
                store.put("b", &format!("k{i}"), Bytes::new(), None).await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(2), writes)
            .await
            .expect("writers are not held up by a full watcher");

        assert_eq!(watch.recv().await.unwrap().key, "k0");
        assert_eq!(watch.recv().await.unwrap().key, "k1");
        let more = tokio::time::timeout(Duration::from_millis(50), watch.recv()).await;
        assert!(more.is_err(), "overflowing events were dropped");
    }
}
