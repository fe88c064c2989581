//! Client dispatch core.
//!
//! A [`Client`] resolves a service to a transport and a node, lazily creates
//! one transport instance per name, runs the middleware chains and enforces
//! per-call deadlines and retries.
//!
//! ```ignore
//! let client = Client::new(ClientConfig::default(), registry)?;
//! let resp: CallResponse = client
//!     .call(&ctx, "echo.Streams", "/echo.Streams/Call", &req, client.options())
//!     .await?;
//! ```

pub mod middleware;
pub mod options;
pub mod retry;
pub mod transport;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use orbkit_errors::OrbError;
use tracing::Instrument;

use crate::codec;
use crate::context::Context;
use crate::message::{DynMessage, Message};
use crate::registry::{Node, Registry};
use crate::stream::ClientStream;

pub use middleware::{
    LogMiddleware, Middleware, MiddlewareRegistration, NoCodecHandler, NoCodecRequest,
    RawRequest, RequestHandler,
};
pub use options::{CallOptions, ClientConfig, DEFAULT_PREFERRED_TRANSPORTS, MiddlewareConfig};
pub use transport::{
    RawResponse, RequestInfo, Transport, TransportFactory, TransportRegistration,
    known_transports,
};

/// Nodes of one service keyed by transport name.
pub type NodeMap = HashMap<String, Vec<Node>>;

const MEMORY: &str = "memory";

/// State shared by the client and its terminal handlers.
struct Dispatch {
    config: ClientConfig,
    registry: Arc<dyn Registry>,
    transports: DashMap<String, Arc<dyn Transport>>,
}

impl Dispatch {
    fn transport(&self, name: &str) -> Result<Arc<dyn Transport>, OrbError> {
        if let Some(t) = self.transports.get(name) {
            return Ok(Arc::clone(t.value()));
        }
        let factory = transport::factory(name).ok_or_else(|| {
            tracing::error!(transport = %name, "transport is not linked into this binary");
            OrbError::INTERNAL_SERVER_ERROR.wrap(format!("failed to create transport {name}"))
        })?;
        let entry = self
            .transports
            .entry(name.to_owned())
            .or_try_insert_with(|| {
                let t = factory(&self.config)?;
                t.start()?;
                tracing::debug!(transport = %name, "transport started");
                Ok::<_, OrbError>(t)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    async fn resolve(&self, ctx: &Context, service: &str, preferred: &[String]) -> Result<NodeMap, OrbError> {
        if service.is_empty() {
            return Err(OrbError::BAD_REQUEST.wrap("service argument is empty"));
        }
        let wants = |t: &str| preferred.is_empty() || preferred.iter().any(|p| p == t);

        let mut nodes = NodeMap::new();
        if wants(MEMORY) && crate::memory::is_serving(service) {
            nodes.insert(MEMORY.to_owned(), vec![Node::new(MEMORY, "", MEMORY)]);
        }

        match ctx.run(self.registry.get_service(service)).await {
            Ok(services) => {
                for svc in services {
                    for node in svc.nodes {
                        // Memory nodes of other processes are unreachable.
                        if node.transport == MEMORY || !wants(&node.transport) {
                            continue;
                        }
                        nodes.entry(node.transport.clone()).or_default().push(node);
                    }
                }
            }
            Err(err) if err.code() == OrbError::NOT_FOUND.code() && !nodes.is_empty() => {}
            Err(err) if err.code() == OrbError::NOT_FOUND.code() => {
                return Err(OrbError::UNAVAILABLE.wrap(err));
            }
            Err(err) => return Err(err),
        }

        if nodes.is_empty() {
            return Err(OrbError::UNAVAILABLE.wrap(format!(
                "no node found for service {service}, requested transports: {preferred:?}"
            )));
        }
        Ok(nodes)
    }

    /// Preferred transports the process knows, in preference order.
    fn candidates(opts: &CallOptions) -> Result<Vec<String>, OrbError> {
        let known = known_transports();
        let matching: Vec<String> = opts
            .preferred_transports
            .iter()
            .filter(|t| known.contains(t.as_str()))
            .cloned()
            .collect();
        if !matching.is_empty() {
            return Ok(matching);
        }
        if opts.any_transport && !known.is_empty() {
            return Ok(known.into_iter().map(str::to_owned).collect());
        }
        Err(OrbError::BAD_REQUEST.wrap(format!(
            "no matching transport: preferred {:?}, known {known:?}",
            opts.preferred_transports
        )))
    }

    async fn select(&self, ctx: &Context, service: &str, opts: &CallOptions) -> Result<Node, OrbError> {
        if let Some(url) = &opts.url {
            let transport = url.scheme().to_owned();
            let address = match (url.host_str(), url.port_or_known_default()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_owned(),
                _ => String::new(),
            };
            return Ok(Node::new("url", address, transport));
        }

        let candidates = Self::candidates(opts)?;
        let nodes = self.resolve(ctx, service, &candidates).await?;
        for transport in &candidates {
            let Some(list) = nodes.get(transport).filter(|l| !l.is_empty()) else {
                continue;
            };
            if let Some(node) = opts.selector.select(service, list) {
                tracing::trace!(%service, %transport, address = %node.address, "node selected");
                return Ok(node.clone());
            }
        }
        Err(OrbError::UNAVAILABLE.wrap(format!(
            "no node found for service {service} on transports {candidates:?}"
        )))
    }

    /// Runs `attempt` until it succeeds, the retry predicate declines, the
    /// retry budget is spent or the caller's context ends.
    async fn with_retry<T, F, Fut>(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        opts: &CallOptions,
        first: Option<Node>,
        attempt_fn: F,
    ) -> Result<T, OrbError>
    where
        F: Fn(Node, Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, OrbError>>,
    {
        let mut preselected = first;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let span = tracing::debug_span!("orb_call", %service, %endpoint, attempt);
            let result = async {
                let node = match preselected.take() {
                    Some(node) => node,
                    None => self.select(ctx, service, opts).await?,
                };
                let transport = self.transport(&node.transport)?;
                attempt_fn(node, transport).await
            }
            .instrument(span)
            .await;

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(%service, %endpoint, attempt, "call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = attempt <= opts.retries && ctx.err().is_none() && (opts.retry)(&err);
                    if !retryable {
                        if attempt > 1 {
                            tracing::error!(%service, %endpoint, attempt, code = err.code(), error = %err, "call failed after retries");
                        }
                        return Err(err);
                    }
                    let delay = (opts.backoff)(attempt);
                    tracing::warn!(
                        %service,
                        %endpoint,
                        attempt,
                        code = err.code(),
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "call failed, retrying"
                    );
                    ctx.run(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
            }
        }
    }
}

/// A fresh call context: the caller's outgoing metadata copied and extended
/// with the call's own, under `timeout`.
fn call_context(ctx: &Context, opts: &CallOptions, timeout: Duration) -> Context {
    let outgoing = ctx.outgoing().deep_clone();
    outgoing.extend(opts.metadata.iter());
    ctx.with_timeout(timeout).with_outgoing(outgoing)
}

fn request_info(service: &str, endpoint: &str, node: &Node) -> RequestInfo {
    RequestInfo {
        service: service.to_owned(),
        endpoint: endpoint.to_owned(),
        transport: node.transport.clone(),
        address: node.address.clone(),
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        endpoint.to_owned()
    } else {
        format!("/{endpoint}")
    }
}

fn terminal_request(dispatch: Arc<Dispatch>) -> RequestHandler {
    Arc::new(move |ctx, req| {
        let dispatch = Arc::clone(&dispatch);
        Box::pin(async move {
            let RawRequest { service, endpoint, body, opts, node } = req;
            let resp = dispatch
                .with_retry(&ctx, &service, &endpoint, &opts, node, |node, transport| {
                    let call_ctx = call_context(&ctx, &opts, opts.request_timeout);
                    let info = request_info(&service, &endpoint, &node);
                    let body = body.clone();
                    let opts = Arc::clone(&opts);
                    async move {
                        call_ctx
                            .run(transport.request(&call_ctx, &info, body, &opts))
                            .await
                    }
                })
                .await?;
            if let Some(md) = &opts.response_metadata {
                md.extend(resp.metadata.iter());
            }
            Ok(resp)
        })
    })
}

fn terminal_no_codec(dispatch: Arc<Dispatch>) -> NoCodecHandler {
    Arc::new(move |ctx, req| {
        let dispatch = Arc::clone(&dispatch);
        Box::pin(async move {
            let NoCodecRequest { service, endpoint, request, result, opts, node } = req;
            dispatch
                .with_retry(&ctx, &service, &endpoint, &opts, node, |node, transport| {
                    let call_ctx = call_context(&ctx, &opts, opts.request_timeout);
                    let info = request_info(&service, &endpoint, &node);
                    let request = Arc::clone(&request);
                    let mut out = result.clone_message();
                    let opts = Arc::clone(&opts);
                    async move {
                        call_ctx
                            .run(transport.request_no_codec(&call_ctx, &info, &*request, &mut *out, &opts))
                            .await?;
                        Ok(out)
                    }
                })
                .await
        })
    })
}

struct Inner {
    dispatch: Arc<Dispatch>,
    defaults: CallOptions,
    middlewares: Vec<Arc<dyn Middleware>>,
    request: RequestHandler,
    no_codec: NoCodecHandler,
}

/// The RPC client. Cheap to clone; clones share transports and pools.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds a client with the middlewares named in `config`.
    ///
    /// # Errors
    /// Returns 400 when a configured middleware is not registered.
    pub fn new(config: ClientConfig, registry: Arc<dyn Registry>) -> Result<Self, OrbError> {
        Self::with_middlewares(config, registry, Vec::new())
    }

    /// Like [`Client::new`], with `extra` appended after the configured
    /// middlewares.
    ///
    /// # Errors
    /// Returns 400 when a configured middleware is not registered.
    pub fn with_middlewares(
        config: ClientConfig,
        registry: Arc<dyn Registry>,
        extra: Vec<Arc<dyn Middleware>>,
    ) -> Result<Self, OrbError> {
        let mut middlewares = middleware::from_config(&config.middlewares)?;
        middlewares.extend(extra);

        let defaults = CallOptions::from_config(&config);
        let dispatch = Arc::new(Dispatch {
            config,
            registry,
            transports: DashMap::new(),
        });
        let request = middleware::chain_request(&middlewares, terminal_request(Arc::clone(&dispatch)));
        let no_codec = middleware::chain_no_codec(&middlewares, terminal_no_codec(Arc::clone(&dispatch)));

        tracing::debug!(
            middlewares = middlewares.len(),
            known = ?known_transports(),
            "client created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                dispatch,
                defaults,
                middlewares,
                request,
                no_codec,
            }),
        })
    }

    /// Call options seeded from the client configuration.
    #[must_use]
    pub fn options(&self) -> CallOptions {
        self.inner.defaults.clone()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.dispatch.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.dispatch.registry
    }

    #[must_use]
    pub fn known_transports(&self) -> BTreeSet<&'static str> {
        known_transports()
    }

    /// The live transport instance for `name`, created on first use.
    ///
    /// # Errors
    /// Returns 500 when no such transport is linked or it fails to start.
    pub fn transport(&self, name: &str) -> Result<Arc<dyn Transport>, OrbError> {
        self.inner.dispatch.transport(name)
    }

    /// Nodes of `service` per transport. An in-process memory server is
    /// listed first-class even when the registry does not know it.
    ///
    /// # Errors
    /// Returns 503 when no node is found, or the registry's error.
    pub async fn resolve_service(
        &self,
        ctx: &Context,
        service: &str,
        preferred: &[String],
    ) -> Result<NodeMap, OrbError> {
        self.inner.dispatch.resolve(ctx, service, preferred).await
    }

    /// Typed unary call. Picks the codec or the no-codec path depending on
    /// the transport that serves `service`.
    ///
    /// # Errors
    /// Any failure, mapped onto the HTTP-coded taxonomy.
    pub async fn call<Req: Message, Resp: Message>(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        req: &Req,
        opts: CallOptions,
    ) -> Result<Resp, OrbError> {
        let endpoint = normalize_endpoint(endpoint);
        let node = self.inner.dispatch.select(ctx, service, &opts).await?;
        let transport = self.inner.dispatch.transport(&node.transport)?;

        if transport.needs_codec() {
            let body = codec::marshal(&opts.content_type, req)?;
            let content_type = opts.content_type.clone();
            let raw = (self.inner.request)(
                ctx.clone(),
                RawRequest {
                    service: service.to_owned(),
                    endpoint,
                    body,
                    opts: Arc::new(opts),
                    node: Some(node),
                },
            )
            .await?;
            let mut out = Resp::default();
            let ct = if raw.content_type.is_empty() { content_type.as_str() } else { raw.content_type.as_str() };
            codec::unmarshal(ct, &raw.body, &mut out)?;
            return Ok(out);
        }

        let out = (self.inner.no_codec)(
            ctx.clone(),
            NoCodecRequest {
                service: service.to_owned(),
                endpoint,
                request: Arc::new(req.clone()),
                result: Arc::new(Resp::default()),
                opts: Arc::new(opts),
                node: Some(node),
            },
        )
        .await?;
        out.downcast::<Resp>()
    }

    /// Unary call with an already encoded body, through the codec chain.
    ///
    /// # Errors
    /// Any failure, mapped onto the HTTP-coded taxonomy. Transports that
    /// only encode on their own answer 501.
    pub async fn call_raw(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        body: Bytes,
        opts: CallOptions,
    ) -> Result<RawResponse, OrbError> {
        (self.inner.request)(
            ctx.clone(),
            RawRequest {
                service: service.to_owned(),
                endpoint: normalize_endpoint(endpoint),
                body,
                opts: Arc::new(opts),
                node: None,
            },
        )
        .await
    }

    /// Unary call where the transport encodes `req` and decodes into
    /// `result` itself.
    ///
    /// # Errors
    /// Any failure, mapped onto the HTTP-coded taxonomy.
    pub async fn call_no_codec(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        req: &dyn DynMessage,
        result: &mut dyn DynMessage,
        opts: CallOptions,
    ) -> Result<(), OrbError> {
        let out = (self.inner.no_codec)(
            ctx.clone(),
            NoCodecRequest {
                service: service.to_owned(),
                endpoint: normalize_endpoint(endpoint),
                request: Arc::from(req.clone_message()),
                result: Arc::from(result.clone_message()),
                opts: Arc::new(opts),
                node: None,
            },
        )
        .await?;
        result.assign(out)
    }

    /// Opens a bidirectional stream. Streams are never retried.
    ///
    /// # Errors
    /// 501 when the chosen transport cannot stream, otherwise the
    /// transport's error.
    pub async fn stream<Req: Message, Resp: Message>(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        opts: &CallOptions,
    ) -> Result<ClientStream<Req, Resp>, OrbError> {
        let endpoint = normalize_endpoint(endpoint);
        let dispatch = &self.inner.dispatch;
        let node = dispatch.select(ctx, service, opts).await?;
        let transport = dispatch.transport(&node.transport)?;
        let info = request_info(service, &endpoint, &node);
        let stream_ctx = call_context(ctx, opts, opts.stream_timeout);

        let raw = stream_ctx
            .run(transport.stream(&stream_ctx, &info, opts))
            .instrument(tracing::debug_span!("orb_stream", %service, %endpoint, transport = %node.transport))
            .await?;
        Ok(ClientStream::new(raw))
    }

    /// Stops every transport this client created.
    ///
    /// # Errors
    /// Returns the first transport error; the others are still stopped.
    pub async fn stop(&self) -> Result<(), OrbError> {
        let transports: Vec<(String, Arc<dyn Transport>)> = self
            .inner
            .dispatch
            .transports
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        self.inner.dispatch.transports.clear();

        let mut first_err = None;
        for (name, transport) in transports {
            if let Err(err) = transport.stop().await {
                tracing::warn!(transport = %name, error = %err, "failed to stop transport");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.inner.dispatch.registry.name())
            .field(
                "transports",
                &self
                    .inner
                    .dispatch
                    .transports
                    .iter()
                    .map(|e| e.key().clone())
                    .collect::<Vec<_>>(),
            )
            .field("middlewares", &self.inner.middlewares.iter().map(|m| m.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::LazyLock;
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::message::testing::{Ping, Pong};
    use crate::metadata::Metadata;
    use crate::registry::{MemoryRegistry, MemoryRegistryConfig, RegisterOptions, Service};

    const CODEC_T: &str = "test-codec";
    const DIRECT_T: &str = "test-direct";

    static ATTEMPTS: LazyLock<DashMap<String, AtomicUsize>> = LazyLock::new(DashMap::new);

    fn attempt(service: &str) -> usize {
        ATTEMPTS
            .entry(service.to_owned())
            .or_default()
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Echoes the body; services named `flaky-N` fail N times with 503,
    /// `slow` sleeps for a second.
    struct CodecTransport;

    #[async_trait]
    impl Transport for CodecTransport {
        fn name(&self) -> &'static str {
            CODEC_T
        }

        fn needs_codec(&self) -> bool {
            true
        }

        async fn request(
            &self,
            ctx: &Context,
            info: &RequestInfo,
            body: Bytes,
            opts: &CallOptions,
        ) -> Result<RawResponse, OrbError> {
            let n = attempt(&info.service);
            if let Some(fails) = info.service.strip_prefix("flaky-") {
                if n <= fails.parse::<usize>().unwrap() {
                    return Err(OrbError::UNAVAILABLE);
                }
            }
            if info.service == "slow" {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let mut metadata = ctx.outgoing().snapshot();
            metadata.insert("x-address".to_owned(), info.address.clone());
            Ok(RawResponse {
                content_type: opts.content_type.clone(),
                body,
                metadata,
            })
        }
    }

    /// Answers `Ping{name}` with `Pong{"Hello " + name}` without codecs.
    struct DirectTransport;

    #[async_trait]
    impl Transport for DirectTransport {
        fn name(&self) -> &'static str {
            DIRECT_T
        }

        fn needs_codec(&self) -> bool {
            false
        }

        async fn request_no_codec(
            &self,
            ctx: &Context,
            _info: &RequestInfo,
            req: &dyn DynMessage,
            result: &mut dyn DynMessage,
            opts: &CallOptions,
        ) -> Result<(), OrbError> {
            let ping = req.downcast_ref::<Ping>().ok_or(OrbError::BAD_REQUEST)?;
            if let Some(md) = &opts.response_metadata {
                md.extend(ctx.outgoing().snapshot());
            }
            result.assign(Box::new(Pong { msg: format!("Hello {}", ping.name) }))
        }
    }

    #[allow(clippy::unnecessary_wraps)]
    fn codec_factory(_cfg: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
        Ok(Arc::new(CodecTransport))
    }

    #[allow(clippy::unnecessary_wraps)]
    fn direct_factory(_cfg: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
        Ok(Arc::new(DirectTransport))
    }

    inventory::submit! { TransportRegistration { name: CODEC_T, factory: codec_factory } }
    inventory::submit! { TransportRegistration { name: DIRECT_T, factory: direct_factory } }

    async fn client_with(services: &[(&str, &str)]) -> Client {
        let registry = Arc::new(MemoryRegistry::standalone(MemoryRegistryConfig::default()));
        for (i, (name, transport)) in services.iter().enumerate() {
            let svc = Service::new(*name, "v1").with_node(Node::new(
                format!("{name}-{i}"),
                "127.0.0.1:1",
                *transport,
            ));
            registry.register(&svc, RegisterOptions::default()).await.unwrap();
        }
        let cfg = ClientConfig::default()
            .with_preferred_transports([CODEC_T, DIRECT_T])
            .with_content_type(codec::MIME_JSON);
        Client::new(cfg, registry).unwrap()
    }

    fn fast(opts: CallOptions) -> CallOptions {
        opts.with_backoff(retry::constant(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_codec_call_roundtrips_metadata() {
        let client = client_with(&[("echo", CODEC_T)]).await;
        let md = Metadata::new();
        let ctx = Context::background();
        ctx.outgoing().set("from-ctx", "1");

        let opts = client
            .options()
            .with_metadata("authorization", "Bearer x")
            .with_response_metadata(md.clone());
        let resp: Ping = client
            .call(&ctx, "echo", "echo/Call", &Ping { name: "Alex".to_owned() }, opts)
            .await
            .unwrap();

        assert_eq!(resp.name, "Alex");
        assert_eq!(md.get("authorization").as_deref(), Some("Bearer x"));
        assert_eq!(md.get("from-ctx").as_deref(), Some("1"));
        // The caller's own outgoing map is untouched.
        assert!(!ctx.outgoing().contains("authorization"));
    }

    #[tokio::test]
    async fn test_no_codec_call() {
        let client = client_with(&[("direct", DIRECT_T)]).await;
        let resp: Pong = client
            .call(
                &Context::background(),
                "direct",
                "/direct/Call",
                &Ping { name: "Alex".to_owned() },
                client.options(),
            )
            .await
            .unwrap();
        assert_eq!(resp.msg, "Hello Alex");

        let mut out = Pong::default();
        client
            .call_no_codec(
                &Context::background(),
                "direct",
                "/direct/Call",
                &Ping { name: "Bo".to_owned() },
                &mut out,
                client.options(),
            )
            .await
            .unwrap();
        assert_eq!(out.msg, "Hello Bo");
    }

    #[tokio::test]
    async fn test_transport_choice_follows_preferences() {
        let client = client_with(&[("both", CODEC_T), ("both", DIRECT_T)]).await;
        let ctx = Context::background();
        let req = Ping { name: "x".to_owned() };

        let opts = client.options().with_preferred_transports([DIRECT_T, CODEC_T]);
        let resp: Pong = client.call(&ctx, "both", "/both/Call", &req, opts).await.unwrap();
        assert_eq!(resp.msg, "Hello x");

        let opts = client.options().with_preferred_transports(["nope"]);
        let err = client.call::<Ping, Pong>(&ctx, "both", "/both/Call", &req, opts).await.unwrap_err();
        assert_eq!(err.code(), 400);

        let opts = client
            .options()
            .with_preferred_transports(["nope"])
            .with_any_transport(true);
        assert!(client.call::<Ping, Ping>(&ctx, "both", "/both/Call", &req, opts).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_service_groups_by_transport() {
        let client = client_with(&[("grouped", CODEC_T), ("grouped", DIRECT_T), ("grouped", CODEC_T)]).await;
        let ctx = Context::background();

        let nodes = client.resolve_service(&ctx, "grouped", &[]).await.unwrap();
        assert_eq!(nodes[CODEC_T].len(), 2);
        assert_eq!(nodes[DIRECT_T].len(), 1);

        let nodes = client
            .resolve_service(&ctx, "grouped", &[DIRECT_T.to_owned()])
            .await
            .unwrap();
        assert_eq!(nodes.keys().collect::<Vec<_>>(), vec![DIRECT_T]);

        let err = client.resolve_service(&ctx, "", &[]).await.unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn test_call_raw_passes_body_through() {
        let client = client_with(&[("raw", CODEC_T)]).await;
        let resp = client
            .call_raw(
                &Context::background(),
                "raw",
                "/raw/Call",
                Bytes::from_static(br#"{"name":"raw"}"#),
                client.options(),
            )
            .await
            .unwrap();
        assert_eq!(resp.content_type, codec::MIME_JSON);
        assert_eq!(&resp.body[..], br#"{"name":"raw"}"#);
        assert_eq!(resp.metadata["x-address"], "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_unknown_service_is_unavailable() {
        let client = client_with(&[]).await;
        let err = client
            .call::<Ping, Ping>(&Context::background(), "ghost", "/ghost/Call", &Ping::default(), client.options())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 503);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let client = client_with(&[("flaky-2", CODEC_T)]).await;
        let opts = fast(client.options()).with_retries(3);
        let resp: Ping = client
            .call(&Context::background(), "flaky-2", "/flaky-2/Call", &Ping::default(), opts)
            .await
            .unwrap();
        assert_eq!(resp, Ping::default());
        assert_eq!(ATTEMPTS.get("flaky-2").unwrap().load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_honored() {
        let client = client_with(&[("flaky-5", CODEC_T)]).await;
        let opts = fast(client.options()).with_retries(1);
        let err = client
            .call::<Ping, Ping>(&Context::background(), "flaky-5", "/flaky-5/Call", &Ping::default(), opts)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 503);
        assert_eq!(ATTEMPTS.get("flaky-5").unwrap().load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let client = client_with(&[("slow", CODEC_T)]).await;
        let opts = client
            .options()
            .with_retries(0)
            .with_request_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = client
            .call::<Ping, Ping>(&Context::background(), "slow", "/slow/Call", &Ping::default(), opts)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 504);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_caller_deadline_wins_over_request_timeout() {
        let client = client_with(&[("slow", CODEC_T)]).await;
        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let err = client
            .call::<Ping, Ping>(&ctx, "slow", "/slow/Call", &Ping::default(), client.options())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 504);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let client = client_with(&[("slow", CODEC_T)]).await;
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = client
            .call::<Ping, Ping>(&ctx, "slow", "/slow/Call", &Ping::default(), client.options())
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_url_override_skips_registry() {
        let client = client_with(&[]).await;
        let md = Metadata::new();
        let opts = client
            .options()
            .with_url(url::Url::parse(&format!("{CODEC_T}://10.0.0.1:4242")).unwrap())
            .with_response_metadata(md.clone());
        let _: Ping = client
            .call(&Context::background(), "anything", "/anything/Call", &Ping::default(), opts)
            .await
            .unwrap();
        assert_eq!(md.get("x-address").as_deref(), Some("10.0.0.1:4242"));
    }

    #[tokio::test]
    async fn test_one_instance_per_transport() {
        let client = client_with(&[]).await;
        let a = client.transport(CODEC_T).unwrap();
        let b = client.transport(CODEC_T).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.transport("nope").err().map(|e| e.code()), Some(500));
        client.stop().await.unwrap();
        let c = client.transport(CODEC_T).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
