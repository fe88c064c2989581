//! In-process registry backend.
//!
//! [`MemoryRegistry::new`] attaches to a single process-wide store, so every
//! instance created in the process sees the same records. A background
//! sweeper prunes nodes whose TTL lapsed. Event fan-out never blocks the
//! producer for longer than `watcher_send_timeout` per watcher; slow
//! watchers miss events.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orbkit_errors::OrbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    Event, EventAction, Node, RegisterOptions, Registry, Service, WatchOptions, Watcher,
    not_found, watcher_stopped,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryRegistryConfig {
    /// TTL applied when [`RegisterOptions::ttl`] is unset. `None` never
    /// expires.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// How long an event send to one watcher may block.
    #[serde(with = "humantime_serde")]
    pub watcher_send_timeout: Duration,
    /// How often expired nodes are pruned.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Per-watcher event buffer.
    pub watcher_buffer: usize,
}

impl Default for MemoryRegistryConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            watcher_send_timeout: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(100),
            watcher_buffer: 64,
        }
    }
}

impl MemoryRegistryConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_watcher_send_timeout(mut self, timeout: Duration) -> Self {
        self.watcher_send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    ttl: Option<Duration>,
    last_seen: Instant,
}

impl NodeEntry {
    fn expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.last_seen) > ttl)
    }
}

#[derive(Debug, Clone)]
struct Record {
    name: String,
    version: String,
    metadata: HashMap<String, String>,
    endpoints: Vec<super::Endpoint>,
    nodes: Vec<NodeEntry>,
}

impl Record {
    fn to_service(&self) -> Service {
        Service {
            name: self.name.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone(),
            nodes: self.nodes.iter().map(|n| n.node.clone()).collect(),
        }
    }
}

struct WatcherSlot {
    opts: WatchOptions,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct State {
    // name -> version -> record
    records: HashMap<String, HashMap<String, Record>>,
    watchers: HashMap<Uuid, WatcherSlot>,
}

struct Store {
    config: MemoryRegistryConfig,
    state: Mutex<State>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    fn new(config: MemoryRegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            sweeper: Mutex::new(None),
        })
    }

    /// Runs the sweeper on the caller's runtime unless one is alive. A
    /// sweeper whose runtime shut down counts as finished and is replaced.
    fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if sweeper.is_some() {
            tracing::debug!("registry sweeper restarted");
        }
        let weak = Arc::downgrade(self);
        *sweeper = Some(handle.spawn(sweep_loop(weak, self.config.sweep_interval)));
    }

    fn senders(&self, service: &str) -> Vec<(Uuid, mpsc::Sender<Event>)> {
        let state = self.state.lock();
        state
            .watchers
            .iter()
            .filter(|(_, w)| w.opts.matches(service))
            .map(|(id, w)| (*id, w.tx.clone()))
            .collect()
    }

    async fn publish(&self, event: Event) {
        let targets = self.senders(&event.service.name);
        let timeout = self.config.watcher_send_timeout;
        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.send_timeout(event.clone(), timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::debug!(
                        watcher = %id,
                        service = %event.service.name,
                        action = %event.action,
                        "registry watcher too slow, event dropped"
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut state = self.state.lock();
            for id in gone {
                state.watchers.remove(&id);
            }
        }
    }

    fn prune(&self, now: Instant) -> Vec<Service> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for versions in state.records.values_mut() {
            for record in versions.values_mut() {
                let (dead, alive): (Vec<_>, Vec<_>) =
                    record.nodes.drain(..).partition(|n| n.expired(now));
                record.nodes = alive;
                if !dead.is_empty() {
                    let mut svc = record.to_service();
                    svc.nodes = dead.into_iter().map(|n| n.node).collect();
                    expired.push(svc);
                }
            }
            versions.retain(|_, r| !r.nodes.is_empty());
        }
        state.records.retain(|_, v| !v.is_empty());
        expired
    }
}

async fn sweep_loop(store: Weak<Store>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        for svc in store.prune(Instant::now()) {
            tracing::debug!(service = %svc.name, version = %svc.version, nodes = svc.nodes.len(), "registry TTL expired");
            store
                .publish(Event {
                    action: EventAction::Delete,
                    service: svc,
                })
                .await;
        }
    }
}

fn global_store(config: &MemoryRegistryConfig) -> Arc<Store> {
    static STORE: OnceLock<Arc<Store>> = OnceLock::new();
    STORE.get_or_init(|| Store::new(config.clone())).clone()
}

/// Registry backed by an in-process store.
#[derive(Clone)]
pub struct MemoryRegistry {
    store: Arc<Store>,
}

impl MemoryRegistry {
    /// Attaches to the process-wide store. The configuration of the first
    /// caller wins.
    #[must_use]
    pub fn new(config: &MemoryRegistryConfig) -> Self {
        Self {
            store: global_store(config),
        }
    }

    /// A registry with a private store, invisible to other instances.
    #[must_use]
    pub fn standalone(config: MemoryRegistryConfig) -> Self {
        Self {
            store: Store::new(config),
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(&MemoryRegistryConfig::default())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), OrbError> {
        if service.nodes.is_empty() {
            return Err(OrbError::BAD_REQUEST.wrap("service has no nodes"));
        }
        self.store.ensure_sweeper();

        let now = Instant::now();
        let ttl = opts.ttl.or(self.store.config.ttl);
        let action = {
            let mut state = self.store.state.lock();
            let versions = state.records.entry(service.name.clone()).or_default();
            if let Some(record) = versions.get_mut(&service.version) {
                for node in &service.nodes {
                    let entry = NodeEntry {
                        node: node.clone(),
                        ttl,
                        last_seen: now,
                    };
                    match record.nodes.iter_mut().find(|n| n.node.id == node.id) {
                        Some(existing) => *existing = entry,
                        None => record.nodes.push(entry),
                    }
                }
                if !service.metadata.is_empty() {
                    record.metadata.clone_from(&service.metadata);
                }
                if !service.endpoints.is_empty() {
                    record.endpoints.clone_from(&service.endpoints);
                }
                EventAction::Update
            } else {
                versions.insert(
                    service.version.clone(),
                    Record {
                        name: service.name.clone(),
                        version: service.version.clone(),
                        metadata: service.metadata.clone(),
                        endpoints: service.endpoints.clone(),
                        nodes: service
                            .nodes
                            .iter()
                            .map(|n| NodeEntry {
                                node: n.clone(),
                                ttl,
                                last_seen: now,
                            })
                            .collect(),
                    },
                );
                EventAction::Create
            }
        };

        tracing::debug!(service = %service.name, version = %service.version, %action, "registry register");
        self.store
            .publish(Event {
                action,
                service: service.clone(),
            })
            .await;
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), OrbError> {
        let removed = {
            let mut state = self.store.state.lock();
            let mut removed = false;
            if let Some(versions) = state.records.get_mut(&service.name) {
                if let Some(record) = versions.get_mut(&service.version) {
                    let before = record.nodes.len();
                    record
                        .nodes
                        .retain(|n| !service.nodes.iter().any(|s| s.id == n.node.id));
                    removed = record.nodes.len() != before;
                    if record.nodes.is_empty() {
                        versions.remove(&service.version);
                    }
                }
                if versions.is_empty() {
                    state.records.remove(&service.name);
                }
            }
            removed
        };

        if removed {
            tracing::debug!(service = %service.name, version = %service.version, "registry deregister");
            self.store
                .publish(Event {
                    action: EventAction::Delete,
                    service: service.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, OrbError> {
        let state = self.store.state.lock();
        let versions = state.records.get(name).ok_or_else(|| not_found(name))?;
        let mut out: Vec<Service> = versions.values().map(Record::to_service).collect();
        if out.is_empty() {
            return Err(not_found(name));
        }
        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }

    async fn list_services(&self) -> Result<Vec<Service>, OrbError> {
        let state = self.store.state.lock();
        let mut out: Vec<Service> = state
            .records
            .values()
            .flat_map(|v| v.values().map(Record::to_service))
            .collect();
        out.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(out)
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, OrbError> {
        self.store.ensure_sweeper();
        let (tx, rx) = mpsc::channel(self.store.config.watcher_buffer.max(1));
        let id = Uuid::new_v4();
        self.store
            .state
            .lock()
            .watchers
            .insert(id, WatcherSlot { opts, tx });
        Ok(Box::new(MemoryWatcher {
            id,
            rx,
            store: Arc::downgrade(&self.store),
            stopped: false,
        }))
    }
}

struct MemoryWatcher {
    id: Uuid,
    rx: mpsc::Receiver<Event>,
    store: Weak<Store>,
    stopped: bool,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Event, OrbError> {
        if self.stopped {
            return Err(watcher_stopped());
        }
        self.rx.recv().await.ok_or_else(watcher_stopped)
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.rx.close();
        if let Some(store) = self.store.upgrade() {
            store.state.lock().watchers.remove(&self.id);
        }
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn registry() -> MemoryRegistry {
        MemoryRegistry::standalone(MemoryRegistryConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let err = registry().get_service("nope").await.unwrap_err();
        assert!(err.is(&OrbError::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_register_merges_nodes_and_emits_update() {
        let reg = registry();
        let mut watcher = reg.watch(WatchOptions::default()).await.unwrap();

        let first = Service::new("foo", "v1").with_node(Node::new("n1", "a:1", "http"));
        let second = Service::new("foo", "v1").with_node(Node::new("n2", "a:2", "grpc"));
        reg.register(&first, RegisterOptions::default()).await.unwrap();
        reg.register(&second, RegisterOptions::default()).await.unwrap();

        assert_eq!(watcher.next().await.unwrap().action, EventAction::Create);
        assert_eq!(watcher.next().await.unwrap().action, EventAction::Update);

        let found = reg.get_service("foo").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_last_deregister_removes_record() {
        let reg = registry();
        let a = Service::new("foo", "v1").with_node(Node::new("n1", "a:1", "http"));
        let b = Service::new("foo", "v1").with_node(Node::new("n2", "a:2", "http"));
        reg.register(&a, RegisterOptions::default()).await.unwrap();
        reg.register(&b, RegisterOptions::default()).await.unwrap();

        reg.deregister(&a).await.unwrap();
        assert_eq!(reg.get_service("foo").await.unwrap()[0].nodes.len(), 1);
        reg.deregister(&b).await.unwrap();
        assert!(reg.get_service("foo").await.is_err());
        assert!(reg.list_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_prunes_and_notifies() {
        let reg = MemoryRegistry::standalone(
            MemoryRegistryConfig::default().with_sweep_interval(Duration::from_millis(10)),
        );
        let mut watcher = reg.watch(WatchOptions::service("ephemeral")).await.unwrap();
        let svc = Service::new("ephemeral", "v1").with_node(Node::new("n1", "a:1", "http"));
        reg.register(
            &svc,
            RegisterOptions {
                ttl: Some(Duration::from_millis(20)),
            },
        )
        .await
        .unwrap();

        assert_eq!(watcher.next().await.unwrap().action, EventAction::Create);
        let ev = tokio::time::timeout(Duration::from_secs(2), watcher.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.action, EventAction::Delete);
        assert!(reg.get_service("ephemeral").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_filter_and_stop() {
        let reg = registry();
        let mut watcher = reg.watch(WatchOptions::service("bar")).await.unwrap();
        reg.register(
            &Service::new("foo", "v1").with_node(Node::new("n1", "a:1", "http")),
            RegisterOptions::default(),
        )
        .await
        .unwrap();
        reg.register(
            &Service::new("bar", "v1").with_node(Node::new("n2", "a:2", "http")),
            RegisterOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(watcher.next().await.unwrap().service.name, "bar");

        watcher.stop();
        let err = watcher.next().await.unwrap_err();
        assert!(super::super::is_watcher_stopped(&err));
    }

    #[tokio::test]
    async fn test_slow_watcher_drops_events() {
        let reg = MemoryRegistry::standalone(MemoryRegistryConfig {
            watcher_buffer: 1,
            ..MemoryRegistryConfig::default()
        });
        let mut watcher = reg.watch(WatchOptions::default()).await.unwrap();
        for i in 0..3 {
            let svc = Service::new("foo", "v1").with_node(Node::new(format!("n{i}"), "a:1", "http"));
            reg.register(&svc, RegisterOptions::default()).await.unwrap();
        }
        assert_eq!(watcher.next().await.unwrap().action, EventAction::Create);
        let pending = tokio::time::timeout(Duration::from_millis(50), watcher.next()).await;
        assert!(pending.is_err(), "later events were dropped");
    }

    #[test]
    fn test_sweeper_survives_runtime_shutdown() {
        let reg = MemoryRegistry::standalone(
            MemoryRegistryConfig::default().with_sweep_interval(Duration::from_millis(10)),
        );
        let runtime = || {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
        };
        let short = RegisterOptions {
            ttl: Some(Duration::from_millis(20)),
        };

        let first = runtime();
        first.block_on(async {
            let svc = Service::new("early", "v1").with_node(Node::new("n1", "a:1", "http"));
            reg.register(&svc, short.clone()).await.unwrap();
        });
        drop(first);

        runtime().block_on(async {
            let mut watcher = reg.watch(WatchOptions::service("late")).await.unwrap();
            let svc = Service::new("late", "v1").with_node(Node::new("n2", "a:2", "http"));
            reg.register(&svc, short.clone()).await.unwrap();
            assert_eq!(watcher.next().await.unwrap().action, EventAction::Create);
            let ev = tokio::time::timeout(Duration::from_secs(2), watcher.next())
                .await
                .expect("expiry reported on the second runtime")
                .unwrap();
            assert_eq!(ev.action, EventAction::Delete);
        });
    }
}
