//! Service registry core.
//!
//! A [`Registry`] stores [`Service`] records, each the union of the nodes
//! sharing a `(name, version)` pair, and streams changes to [`Watcher`]s.
//! Two backends ship with the crate: the process-wide [`memory`] store and
//! the key-value backed [`kv`] store. [`cache`] adds a watch-driven read
//! cache on top of either.

pub mod cache;
pub mod kv;
pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use orbkit_errors::OrbError;
use serde::{Deserialize, Serialize};

pub use cache::CachedRegistry;
pub use kv::{KvRegistry, KvRegistryConfig};
pub use memory::{MemoryRegistry, MemoryRegistryConfig};

/// One advertised instance of a service over one transport at one address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Canonical RPC path, `/<service>/<Method>`.
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, name: impl Into<String>) -> Self {
        self.endpoints.push(Endpoint {
            name: name.into(),
            metadata: HashMap::new(),
        });
        self
    }

    /// Nodes grouped by transport name, order preserved within a group.
    #[must_use]
    pub fn nodes_by_transport(&self) -> HashMap<String, Vec<Node>> {
        let mut out: HashMap<String, Vec<Node>> = HashMap::new();
        for node in &self.nodes {
            out.entry(node.transport.clone())
                .or_default()
                .push(node.clone());
        }
        out
    }
}

impl Node {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            transport: transport.into(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// A registry change as seen by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: EventAction,
    pub service: Service,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Nodes not refreshed within this window are pruned. `None` never
    /// expires.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Only report events for this service name.
    pub service: Option<String>,
}

impl WatchOptions {
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    pub(crate) fn matches(&self, service: &str) -> bool {
        self.service.as_deref().is_none_or(|s| s == service)
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Backend name, e.g. `memory` or `kvstore`.
    fn name(&self) -> &'static str;

    /// Adds or refreshes the nodes of `service`.
    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), OrbError>;

    /// Removes the nodes of `service`; the record goes away with its last node.
    async fn deregister(&self, service: &Service) -> Result<(), OrbError>;

    /// Every version of `name`.
    ///
    /// # Errors
    /// Returns [`OrbError::NOT_FOUND`] when no node of `name` is registered.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, OrbError>;

    async fn list_services(&self) -> Result<Vec<Service>, OrbError>;

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, OrbError>;
}

#[async_trait]
pub trait Watcher: Send {
    /// Blocks until the next event.
    ///
    /// # Errors
    /// Returns [`watcher_stopped`] once [`Watcher::stop`] was called or the
    /// backend went away.
    async fn next(&mut self) -> Result<Event, OrbError>;

    /// Releases the underlying subscription. Idempotent.
    fn stop(&mut self);
}

/// The error returned by [`Watcher::next`] after the watcher stopped.
#[must_use]
pub fn watcher_stopped() -> OrbError {
    OrbError::new(OrbError::UNAVAILABLE.code(), "watcher stopped")
}

#[must_use]
pub fn is_watcher_stopped(err: &OrbError) -> bool {
    err.code() == OrbError::UNAVAILABLE.code() && err.message() == "watcher stopped"
}

pub(crate) fn not_found(name: &str) -> OrbError {
    OrbError::NOT_FOUND.wrap(format!("service '{name}'"))
}

/// A bare `(name, version, node)` triple, the unit KV-backed stores keep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    pub node: Node,
}

/// Flattens a service into one entry per node.
#[must_use]
pub fn split_service(service: &Service) -> Vec<ServiceNode> {
    service
        .nodes
        .iter()
        .map(|node| ServiceNode {
            name: service.name.clone(),
            version: service.version.clone(),
            metadata: service.metadata.clone(),
            endpoints: service.endpoints.clone(),
            node: node.clone(),
        })
        .collect()
}

/// Regroups flattened nodes by `(name, version)`, in name then version order.
#[must_use]
pub fn group_nodes(entries: impl IntoIterator<Item = ServiceNode>) -> Vec<Service> {
    let mut grouped: BTreeMap<(String, String), Service> = BTreeMap::new();
    for entry in entries {
        let svc = grouped
            .entry((entry.name.clone(), entry.version.clone()))
            .or_insert_with(|| Service {
                name: entry.name.clone(),
                version: entry.version.clone(),
                metadata: entry.metadata.clone(),
                endpoints: entry.endpoints.clone(),
                nodes: Vec::new(),
            });
        if svc.endpoints.is_empty() {
            svc.endpoints = entry.endpoints;
        }
        match svc.nodes.iter_mut().find(|n| n.id == entry.node.id) {
            Some(existing) => *existing = entry.node,
            None => svc.nodes.push(entry.node),
        }
    }
    grouped.into_values().collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_group_nodes_merges_same_version() {
        let a = Service::new("foo", "v1").with_node(Node::new("n1", "a:1", "http"));
        let b = Service::new("foo", "v1").with_node(Node::new("n2", "b:1", "grpc"));
        let c = Service::new("foo", "v2").with_node(Node::new("n3", "c:1", "drpc"));
        let grouped = group_nodes(
            split_service(&c)
                .into_iter()
                .chain(split_service(&b))
                .chain(split_service(&a)),
        );
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].version, "v1");
        assert_eq!(grouped[0].nodes.len(), 2);
        assert_eq!(grouped[1].nodes[0].id, "n3");
    }

    #[test]
    fn test_nodes_by_transport() {
        let svc = Service::new("foo", "v1")
            .with_node(Node::new("n1", "a:1", "http"))
            .with_node(Node::new("n2", "a:2", "http"))
            .with_node(Node::new("n3", "a:3", "grpc"));
        let by = svc.nodes_by_transport();
        assert_eq!(by["http"].len(), 2);
        assert_eq!(by["grpc"].len(), 1);
    }
}
