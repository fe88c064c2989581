//! Registry backend on top of a [`KeyValueStore`].
//!
//! Every node is stored under its own key, `<name>@<nodeId>@<version>`,
//! with the JSON-encoded [`ServiceNode`] as value. Reads list the keys,
//! decode each entry and regroup the nodes by `(name, version)`.

mod store;
mod watcher;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use orbkit_errors::OrbError;
use serde::{Deserialize, Serialize};

pub use store::{
    KeyValueStore, KvEntry, KvEvent, KvOperation, KvWatch, MemoryKeyValueStore, MemoryKvConfig,
};
pub use watcher::KvWatcher;

use super::{
    RegisterOptions, Registry, Service, ServiceNode, WatchOptions, Watcher, group_nodes,
    not_found, split_service,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KvRegistryConfig {
    pub database: String,
    pub table: String,
    /// Separates name, node id and version inside a key.
    pub delimiter: String,
    /// Give the table its own bucket instead of prefixing keys with it.
    pub bucket_per_table: bool,
    /// Wrap values in a `{key, data, metadata}` envelope, as legacy readers
    /// expect.
    pub json_key_values: bool,
    /// Applied when [`RegisterOptions::ttl`] is unset.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Settings of the store [`KvRegistry::in_memory`] creates.
    pub store: MemoryKvConfig,
}

impl Default for KvRegistryConfig {
    fn default() -> Self {
        Self {
            database: "service-registry".to_owned(),
            table: "service-registry".to_owned(),
            delimiter: "@".to_owned(),
            bucket_per_table: true,
            json_key_values: false,
            ttl: None,
            store: MemoryKvConfig::default(),
        }
    }
}

impl KvRegistryConfig {
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    #[must_use]
    pub fn with_bucket_per_table(mut self, enabled: bool) -> Self {
        self.bucket_per_table = enabled;
        self
    }

    #[must_use]
    pub fn with_json_key_values(mut self, enabled: bool) -> Self {
        self.json_key_values = enabled;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Serialize, Deserialize)]
struct KeyValueEnvelope {
    key: String,
    data: String,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Maps registry keys and values to what the store holds.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    config: KvRegistryConfig,
}

impl Layout {
    fn new(config: KvRegistryConfig) -> Self {
        Self { config }
    }

    pub(crate) fn bucket(&self) -> String {
        if self.config.bucket_per_table && !self.config.table.is_empty() {
            format!("{}_{}", self.config.database, self.config.table)
        } else {
            self.config.database.clone()
        }
    }

    fn table_prefix(&self) -> String {
        if self.config.bucket_per_table || self.config.table.is_empty() {
            String::new()
        } else {
            format!("{}_", self.config.table)
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{key}", self.table_prefix())
    }

    pub(crate) fn registry_key<'a>(&self, store_key: &'a str) -> Option<&'a str> {
        store_key.strip_prefix(self.table_prefix().as_str())
    }

    fn node_key(&self, node: &ServiceNode) -> String {
        let d = &self.config.delimiter;
        format!("{}{d}{}{d}{}", node.name, node.node.id, node.version)
    }

    /// `(name, node id, version)` of a registry key.
    pub(crate) fn parse_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let mut parts = key.splitn(3, self.config.delimiter.as_str());
        let name = parts.next()?;
        let id = parts.next()?;
        let version = parts.next()?;
        Some((name, id, version))
    }

    fn encode(&self, key: &str, node: &ServiceNode) -> Result<Bytes, OrbError> {
        let data = serde_json::to_vec(node).map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?;
        if !self.config.json_key_values {
            return Ok(Bytes::from(data));
        }
        let envelope = KeyValueEnvelope {
            key: key.to_owned(),
            data: STANDARD.encode(data),
            metadata: serde_json::Map::new(),
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }

    pub(crate) fn decode(&self, value: &[u8]) -> Result<ServiceNode, OrbError> {
        let data = if self.config.json_key_values {
            let envelope: KeyValueEnvelope =
                serde_json::from_slice(value).map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?;
            Cow::Owned(
                STANDARD
                    .decode(envelope.data)
                    .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?,
            )
        } else {
            Cow::Borrowed(value)
        };
        serde_json::from_slice(&data).map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }
}

/// A [`Registry`] persisting nodes in a [`KeyValueStore`].
#[derive(Clone)]
pub struct KvRegistry {
    store: Arc<dyn KeyValueStore>,
    layout: Layout,
}

impl KvRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: KvRegistryConfig) -> Self {
        Self {
            store,
            layout: Layout::new(config),
        }
    }

    /// A registry over a fresh [`MemoryKeyValueStore`].
    #[must_use]
    pub fn in_memory(config: KvRegistryConfig) -> Self {
        let store = MemoryKeyValueStore::with_config(config.store.clone());
        Self::new(Arc::new(store), config)
    }

    fn validate(&self, service: &Service) -> Result<(), OrbError> {
        let delim = self.layout.config.delimiter.as_str();
        if service.name.is_empty() {
            return Err(OrbError::BAD_REQUEST.wrap("service name is empty"));
        }
        if service.nodes.is_empty() {
            return Err(OrbError::BAD_REQUEST.wrap("service has no nodes"));
        }
        if service.name.contains(delim) || service.nodes.iter().any(|n| n.id.contains(delim)) {
            return Err(OrbError::BAD_REQUEST.wrap(format!(
                "service name and node ids must not contain '{delim}'"
            )));
        }
        Ok(())
    }

    async fn load(&self, prefix: &str) -> Result<Vec<ServiceNode>, OrbError> {
        let bucket = self.layout.bucket();
        let keys = self
            .store
            .keys(&bucket, &self.layout.store_key(prefix))
            .await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // Deleted between listing and reading.
            let Some(entry) = self.store.get(&bucket, &key).await? else {
                continue;
            };
            match self.layout.decode(&entry.value) {
                Ok(node) => out.push(node),
                Err(err) => tracing::warn!(%key, error = %err, "skipping undecodable registry entry"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Registry for KvRegistry {
    fn name(&self) -> &'static str {
        "kvstore"
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), OrbError> {
        self.validate(service)?;
        let bucket = self.layout.bucket();
        let ttl = opts.ttl.or(self.layout.config.ttl);
        for node in split_service(service) {
            let key = self.layout.node_key(&node);
            let value = self.layout.encode(&key, &node)?;
            tracing::trace!(%key, "registering service node");
            self.store
                .put(&bucket, &self.layout.store_key(&key), value, ttl)
                .await?;
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), OrbError> {
        let bucket = self.layout.bucket();
        for node in split_service(service) {
            let key = self.layout.node_key(&node);
            tracing::trace!(%key, "deregistering service node");
            self.store.purge(&bucket, &self.layout.store_key(&key)).await?;
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, OrbError> {
        let prefix = format!("{name}{}", self.layout.config.delimiter);
        let nodes = self.load(&prefix).await?;
        let services = group_nodes(nodes.into_iter().filter(|n| n.name == name));
        if services.is_empty() {
            return Err(not_found(name));
        }
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>, OrbError> {
        Ok(group_nodes(self.load("").await?))
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>, OrbError> {
        let prefix = match &opts.service {
            Some(name) => self
                .layout
                .store_key(&format!("{name}{}", self.layout.config.delimiter)),
            None => self.layout.store_key(""),
        };
        let watch = self.store.watch(&self.layout.bucket(), &prefix).await?;
        Ok(Box::new(KvWatcher::new(watch, self.layout.clone(), opts)))
    }
}
