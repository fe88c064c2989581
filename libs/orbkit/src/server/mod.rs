//! Server entrypoint core.
//!
//! A [`Server`] owns one or more entrypoints, each a transport bound to an
//! address with its own configuration. A single [`RegistrationFn`] is fanned
//! out to every entrypoint, and every started entrypoint is advertised in the
//! registry as a node `<service>-<uuid>` carrying the union of its endpoints.

pub mod middleware;
pub mod mux;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orbkit_errors::OrbError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::MiddlewareConfig;
use crate::registry::{Endpoint, Node, RegisterOptions, Registry, Service};
use crate::tls::TlsConfig;

pub use middleware::{LogMiddleware, ServerMiddleware, ServerMiddlewareRegistration};
pub use mux::{
    DrpcMux, GrpcMux, HandlerTable, HttpMux, MemoryMux, Method, RegistrationFn, ServerMux,
    StreamHandler, UnaryHandler,
};

/// One entrypoint: a transport plugin bound to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntrypointConfig {
    /// Unique within the server, used for lookups.
    pub name: String,
    /// Transport plugin: `grpc`, `grpcs`, `drpc`, `http`, `https`, `h2c`,
    /// `http3` or `memory`.
    pub plugin: String,
    pub enabled: bool,
    /// `host:port`; port 0 picks a free port.
    pub address: String,
    pub tls: Option<TlsConfig>,
    /// Upper bound for each unary handler. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub handler_timeout: Duration,
    /// Compress HTTP responses when the client accepts gzip.
    pub gzip: bool,
    /// Also serve HTTP/3 on the same port, over UDP. HTTPS only.
    pub http3: bool,
    pub max_concurrent_streams: u32,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Content types (or codec names such as `json`) the HTTP entrypoint
    /// accepts. Empty accepts every registered codec.
    pub codec_whitelist: Vec<String>,
}

impl Default for EntrypointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            plugin: String::new(),
            enabled: true,
            address: "127.0.0.1:0".to_owned(),
            tls: None,
            handler_timeout: Duration::from_secs(5),
            gzip: false,
            http3: false,
            max_concurrent_streams: 256,
            read_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            codec_whitelist: Vec::new(),
        }
    }
}

impl EntrypointConfig {
    /// An entrypoint for `plugin`, named after it, on a free local port.
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        let plugin = plugin.into();
        Self {
            name: plugin.clone(),
            plugin,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    #[must_use]
    pub fn with_http3(mut self, http3: bool) -> Self {
        self.http3 = http3;
        self
    }

    #[must_use]
    pub fn with_codec_whitelist<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.codec_whitelist = content_types.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub entrypoints: Vec<EntrypointConfig>,
    /// Applied to every unary handler, first is outermost.
    pub middlewares: Vec<MiddlewareConfig>,
    /// Re-registers every entrypoint at this interval so TTL-based
    /// registries keep it alive. Zero registers once.
    #[serde(with = "humantime_serde")]
    pub register_interval: Duration,
    /// TTL passed along with each registration.
    #[serde(with = "humantime_serde::option")]
    pub register_ttl: Option<Duration>,
}

impl ServerConfig {
    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: EntrypointConfig) -> Self {
        self.entrypoints.push(entrypoint);
        self
    }

    #[must_use]
    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(MiddlewareConfig { name: name.into() });
        self
    }

    #[must_use]
    pub fn with_register_interval(mut self, interval: Duration, ttl: Duration) -> Self {
        self.register_interval = interval;
        self.register_ttl = Some(ttl);
        self
    }
}

/// Everything a transport needs to build an entrypoint.
#[derive(Debug, Clone)]
pub struct EntrypointSetup {
    pub service: String,
    pub config: EntrypointConfig,
    pub table: Arc<HandlerTable>,
}

#[async_trait]
pub trait Entrypoint: Send + Sync {
    fn name(&self) -> &str;

    /// The transport plugin name advertised in the registry.
    fn transport(&self) -> &'static str;

    /// Hands this entrypoint's mux to `f`.
    fn register(&self, f: &RegistrationFn);

    /// Endpoints declared by the registered handlers.
    fn endpoints(&self) -> Vec<String>;

    /// The bound address; the configured one before `start`.
    fn address(&self) -> String;

    /// Binds the listener and spawns the serve loop.
    ///
    /// # Errors
    /// Fails when the address cannot be bound or TLS material is invalid.
    async fn start(&self) -> Result<(), OrbError>;

    /// Stops serving. Calling it twice is harmless.
    ///
    /// # Errors
    /// Returns the serve loop's shutdown error.
    async fn stop(&self) -> Result<(), OrbError>;
}

pub type EntrypointFactory = fn(EntrypointSetup) -> Result<Arc<dyn Entrypoint>, OrbError>;

/// Link-time registration of an entrypoint factory for the given plugins.
pub struct EntrypointRegistration {
    pub transports: &'static [&'static str],
    pub factory: EntrypointFactory,
}

inventory::collect!(EntrypointRegistration);

fn entrypoint_factory(plugin: &str) -> Option<EntrypointFactory> {
    inventory::iter::<EntrypointRegistration>
        .into_iter()
        .find(|r| r.transports.contains(&plugin))
        .map(|r| r.factory)
}

struct Slot {
    entrypoint: Arc<dyn Entrypoint>,
    node_id: String,
}

impl Slot {
    fn service(&self, name: &str, version: &str) -> Service {
        Service {
            name: name.to_owned(),
            version: version.to_owned(),
            metadata: HashMap::new(),
            endpoints: self
                .entrypoint
                .endpoints()
                .into_iter()
                .map(|name| Endpoint { name, metadata: HashMap::new() })
                .collect(),
            nodes: vec![Node::new(
                self.node_id.clone(),
                self.entrypoint.address(),
                self.entrypoint.transport(),
            )],
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    heartbeat: Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
}

pub struct Server {
    service: String,
    version: String,
    config: ServerConfig,
    registry: Arc<dyn Registry>,
    middlewares: Vec<Arc<dyn ServerMiddleware>>,
    slots: Vec<Slot>,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    /// Builds every enabled entrypoint in `config`.
    ///
    /// # Errors
    /// 400 when a middleware or an entrypoint plugin is unknown, or when two
    /// entrypoints share a name.
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        config: ServerConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, OrbError> {
        let middlewares = middleware::from_config(&config.middlewares)?;
        let mut server = Self {
            service: service.into(),
            version: version.into(),
            config,
            registry,
            middlewares,
            slots: Vec::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        };
        for ep in server.config.entrypoints.clone() {
            if ep.enabled {
                server.add_entrypoint(ep)?;
            }
        }
        Ok(server)
    }

    /// Adds an entrypoint after construction. Must happen before `start`.
    ///
    /// # Errors
    /// 400 for an unknown plugin or a duplicate name.
    pub fn add_entrypoint(&mut self, config: EntrypointConfig) -> Result<(), OrbError> {
        if self.slots.iter().any(|s| s.entrypoint.name() == config.name) {
            return Err(OrbError::BAD_REQUEST.wrap(format!("duplicate entrypoint name {}", config.name)));
        }
        let factory = entrypoint_factory(&config.plugin).ok_or_else(|| {
            OrbError::BAD_REQUEST.wrap(format!("unknown entrypoint plugin {}", config.plugin))
        })?;
        let table = Arc::new(HandlerTable::new(self.middlewares.clone(), config.handler_timeout));
        let entrypoint = factory(EntrypointSetup {
            service: self.service.clone(),
            config,
            table,
        })?;
        tracing::debug!(
            service = %self.service,
            entrypoint = %entrypoint.name(),
            transport = entrypoint.transport(),
            "entrypoint created"
        );
        self.slots.push(Slot {
            entrypoint,
            node_id: format!("{}-{}", self.service, uuid::Uuid::new_v4()),
        });
        Ok(())
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Fans `f` out to every entrypoint.
    pub fn register(&self, f: &RegistrationFn) {
        for slot in &self.slots {
            slot.entrypoint.register(f);
        }
    }

    #[must_use]
    pub fn entrypoint(&self, name: &str) -> Option<Arc<dyn Entrypoint>> {
        self.slots
            .iter()
            .find(|s| s.entrypoint.name() == name)
            .map(|s| Arc::clone(&s.entrypoint))
    }

    pub fn entrypoints(&self) -> impl Iterator<Item = &Arc<dyn Entrypoint>> {
        self.slots.iter().map(|s| &s.entrypoint)
    }

    /// Bound address of the entrypoint `name`.
    #[must_use]
    pub fn address(&self, name: &str) -> Option<String> {
        self.entrypoint(name).map(|e| e.address())
    }

    /// Starts every entrypoint and advertises it. Entrypoints already
    /// started are stopped again when a later one fails.
    ///
    /// # Errors
    /// The first start or registry failure.
    pub async fn start(&self) -> Result<(), OrbError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }

        for (i, slot) in self.slots.iter().enumerate() {
            let res = match slot.entrypoint.start().await {
                Ok(()) => self.advertise(slot).await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                tracing::error!(
                    service = %self.service,
                    entrypoint = %slot.entrypoint.name(),
                    error = %err,
                    "failed to start entrypoint"
                );
                for started in self.slots.iter().take(i + 1) {
                    self.retire(started).await;
                }
                return Err(err);
            }
            tracing::info!(
                service = %self.service,
                entrypoint = %slot.entrypoint.name(),
                transport = slot.entrypoint.transport(),
                address = %slot.entrypoint.address(),
                "entrypoint started"
            );
        }

        if !self.config.register_interval.is_zero() {
            lifecycle.heartbeat = Some(self.spawn_heartbeat());
        }
        lifecycle.started = true;
        Ok(())
    }

    async fn advertise(&self, slot: &Slot) -> Result<(), OrbError> {
        let svc = slot.service(&self.service, &self.version);
        self.registry
            .register(&svc, RegisterOptions { ttl: self.config.register_ttl })
            .await
    }

    /// Deregisters and stops one entrypoint, logging failures.
    async fn retire(&self, slot: &Slot) {
        let svc = slot.service(&self.service, &self.version);
        if let Err(err) = self.registry.deregister(&svc).await {
            if err.code() != OrbError::NOT_FOUND.code() {
                tracing::warn!(node = %slot.node_id, error = %err, "failed to deregister entrypoint");
            }
        }
        if let Err(err) = slot.entrypoint.stop().await {
            tracing::warn!(entrypoint = %slot.entrypoint.name(), error = %err, "failed to stop entrypoint");
        }
    }

    fn spawn_heartbeat(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = Arc::clone(&self.registry);
        let services: Vec<Service> = self
            .slots
            .iter()
            .map(|s| s.service(&self.service, &self.version))
            .collect();
        let interval = self.config.register_interval;
        let ttl = self.config.register_ttl;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for svc in &services {
                    if let Err(err) = registry.register(svc, RegisterOptions { ttl }).await {
                        tracing::warn!(service = %svc.name, error = %err, "registry heartbeat failed");
                    }
                }
            }
        });
        (cancel, handle)
    }

    /// Deregisters and stops every entrypoint. Idempotent.
    ///
    /// # Errors
    /// Never fails today; individual failures are logged.
    pub async fn stop(&self) -> Result<(), OrbError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.started {
            return Ok(());
        }
        if let Some((cancel, handle)) = lifecycle.heartbeat.take() {
            cancel.cancel();
            if let Err(err) = handle.await {
                tracing::debug!(error = %err, "heartbeat task ended abnormally");
            }
        }
        for slot in &self.slots {
            self.retire(slot).await;
        }
        lifecycle.started = false;
        tracing::info!(service = %self.service, "server stopped");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.service)
            .field("version", &self.version)
            .field(
                "entrypoints",
                &self.slots.iter().map(|s| s.entrypoint.name().to_owned()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
