//! Watch-driven read cache in front of any [`Registry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use orbkit_errors::OrbError;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    Event, EventAction, RegisterOptions, Registry, Service, WatchOptions, Watcher,
    is_watcher_stopped, not_found,
};

type Records = BTreeMap<(String, String), Service>;

#[derive(Default)]
struct Task {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Serves `get_service` and `list_services` from memory, kept current by a
/// watcher on the backend. Misses fall through to the backend.
pub struct CachedRegistry {
    backend: Arc<dyn Registry>,
    records: Arc<RwLock<Records>>,
    task: Mutex<Task>,
}

impl CachedRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn Registry>) -> Self {
        Self {
            backend,
            records: Arc::new(RwLock::new(BTreeMap::new())),
            task: Mutex::new(Task::default()),
        }
    }

    /// Loads the backend's records and starts following its changes.
    ///
    /// # Errors
    /// Fails when the backend cannot be listed or watched.
    pub async fn start(&self) -> Result<(), OrbError> {
        let mut watcher = self.backend.watch(WatchOptions::default()).await?;
        let initial = self.backend.list_services().await?;
        {
            let mut records = self.records.write();
            records.clear();
            for svc in initial {
                records.insert((svc.name.clone(), svc.version.clone()), svc);
            }
        }

        let cancel = CancellationToken::new();
        let records = Arc::clone(&self.records);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    ev = watcher.next() => ev,
                };
                match event {
                    Ok(ev) => apply(&mut records.write(), ev),
                    Err(err) if is_watcher_stopped(&err) => break,
                    Err(err) => tracing::warn!(error = %err, "registry cache watch failed"),
                }
            }
            watcher.stop();
        });

        let mut task = self.task.lock();
        task.cancel.cancel();
        *task = Task {
            cancel,
            handle: Some(handle),
        };
        Ok(())
    }

    /// Stops following the backend. The cached records stay readable.
    pub async fn stop(&self) {
        let handle = {
            let mut task = self.task.lock();
            task.cancel.cancel();
            task.handle.take()
        };
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "registry cache task failed");
        }
    }

    fn cached(&self, name: &str) -> Vec<Service> {
        self.records
            .read()
            .values()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }
}

fn apply(records: &mut Records, event: Event) {
    let key = (event.service.name.clone(), event.service.version.clone());
    match event.action {
        EventAction::Create | EventAction::Update => {
            let entry = records.entry(key).or_insert_with(|| Service {
                nodes: Vec::new(),
                ..event.service.clone()
            });
            if !event.service.endpoints.is_empty() {
                entry.endpoints.clone_from(&event.service.endpoints);
            }
            for node in event.service.nodes {
                match entry.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) => *existing = node,
                    None => entry.nodes.push(node),
                }
            }
        }
        EventAction::Delete => {
            if let Some(entry) = records.get_mut(&key) {
                entry
                    .nodes
                    .retain(|n| !event.service.nodes.iter().any(|d| d.id == n.id));
                if entry.nodes.is_empty() {
                    records.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl Registry for CachedRegistry {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), OrbError> {
        self.backend.register(service, opts).await?;
        apply(
            &mut self.records.write(),
            Event {
                action: EventAction::Update,
                service: service.clone(),
            },
        );
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), OrbError> {
        self.backend.deregister(service).await?;
        apply(
            &mut self.records.write(),
            Event {
                action: EventAction::Delete,
                service: service.clone(),
            },
        );
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, OrbError> {
        let hit = self.cached(name);
        if !hit.is_empty() {
            return Ok(hit);
        }
        let fetched = self.backend.get_service(name).await?;
        if fetched.is_empty() {
            return Err(not_found(name));
        }
        let mut records = self.records.write();
        for svc in &fetched {
            records.insert((svc.name.clone(), svc.version.clone()), svc.clone());
        }
        Ok(fetched)
    }

    async fn list_services(&self) -> Result<Vec<Service>, OrbError> {
        let cached: Vec<Service> = self.records.read().values().cloned().collect();
        if cached.is_empty() {
            return self.backend.list_services().await;
        }
        Ok(cached)
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, OrbError> {
        self.backend.watch(opts).await
    }
}

impl Drop for CachedRegistry {
    fn drop(&mut self) {
        self.task.get_mut().cancel.cancel();
    }
}
