//! The gRPC entrypoint.
//!
//! One tonic server per entrypoint. Every path is routed through the
//! entrypoint's handler table, so no per-service tonic code is needed:
//! unary methods go through `Grpc::unary`, streaming ones through
//! `Grpc::streaming`, both with the pass-through codec.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use orbkit::codec;
use orbkit::context::Context;
use orbkit::message::DynMessage;
use orbkit::metadata::{self as md, Metadata, split_endpoint};
use orbkit::server::{
    Entrypoint, EntrypointConfig, EntrypointRegistration, EntrypointSetup, GrpcMux, HandlerTable,
    Method, RegistrationFn, ServerMux, StreamHandler,
};
use orbkit::stream::{RawStream, send_closed};
use orbkit_errors::OrbError;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::service::Routes;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::Streaming;
use tracing::Instrument as _;

use crate::codec::RawCodec;
use crate::metadata;
use crate::{NAME, NAME_TLS, STREAM_BUFFER};

/// Handler context for one incoming call.
fn server_context(map: &MetadataMap, endpoint: &str, content_type: &str) -> Context {
    let incoming = Metadata::from_map(metadata::read(map));
    incoming.set(md::CONTENT_TYPE, content_type);
    let (service, method) = split_endpoint(endpoint);
    incoming.set(md::SERVICE, service);
    incoming.set(md::METHOD, method);
    let ctx = Context::background().with_incoming(incoming);
    match metadata::timeout(map) {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}

/// Tower service behind the tonic router.
#[derive(Clone)]
struct GrpcRouter {
    table: Arc<HandlerTable>,
}

impl tower::Service<http::Request<axum::body::Body>> for GrpcRouter {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let table = Arc::clone(&self.table);
        Box::pin(async move { Ok(dispatch(table, req).await) })
    }
}

async fn dispatch(table: Arc<HandlerTable>, req: http::Request<axum::body::Body>) -> http::Response<Body> {
    let endpoint = req.uri().path().to_owned();
    match table.method(&endpoint) {
        Some(Method::Unary { .. }) => {
            Grpc::new(RawCodec)
                .unary(UnaryCall { table, endpoint }, req)
                .await
        }
        Some(Method::Stream(handler)) => {
            Grpc::new(RawCodec)
                .streaming(StreamCall { handler, endpoint }, req)
                .await
        }
        None => {
            tracing::debug!(%endpoint, "grpc call to unknown method");
            Status::from(OrbError::NOT_FOUND.wrap(format!("unknown method {endpoint}"))).into_http()
        }
    }
}

struct UnaryCall {
    table: Arc<HandlerTable>,
    endpoint: String,
}

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<tonic::Response<Bytes>, Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let table = Arc::clone(&self.table);
        let endpoint = std::mem::take(&mut self.endpoint);
        Box::pin(async move {
            let content_type = metadata::content_type(request.metadata());
            let ctx = server_context(request.metadata(), &endpoint, &content_type);
            let body = request.into_inner();

            let req = table.decode_request(&endpoint, &content_type, &body)?;
            let resp = table.invoke_unary(&ctx, &endpoint, req).await?;

            let mut out = tonic::Response::new(codec::marshal(&content_type, resp.as_ref())?);
            metadata::write(out.metadata_mut(), &ctx.outgoing().snapshot());
            metadata::set_content_type(out.metadata_mut(), &content_type);
            Ok(out)
        })
    }
}

struct StreamCall {
    handler: StreamHandler,
    endpoint: String,
}

impl StreamingService<Bytes> for StreamCall {
    type Response = Bytes;
    type ResponseStream = ReceiverStream<Result<Bytes, Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let endpoint = std::mem::take(&mut self.endpoint);
        Box::pin(async move {
            let content_type = metadata::content_type(request.metadata());
            let ctx = server_context(request.metadata(), &endpoint, &content_type);
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            let stream = GrpcServerStream {
                ctx,
                inbound: request.into_inner(),
                tx: Some(tx.clone()),
                content_type,
            };

            let span = tracing::debug_span!("grpc_stream", %endpoint);
            tokio::spawn(
                async move {
                    if let Err(err) = handler(Box::new(stream)).await {
                        tracing::debug!(code = err.code(), error = %err, "stream handler failed");
                        if tx.send(Err(Status::from(err))).await.is_err() {
                            tracing::trace!("stream client gone before the handler error");
                        }
                    }
                }
                .instrument(span),
            );
            Ok(tonic::Response::new(ReceiverStream::new(rx)))
        })
    }
}

struct GrpcServerStream {
    ctx: Context,
    inbound: Streaming<Bytes>,
    tx: Option<mpsc::Sender<Result<Bytes, Status>>>,
    content_type: String,
}

#[async_trait]
impl RawStream for GrpcServerStream {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError> {
        let Some(tx) = &self.tx else {
            return Err(send_closed());
        };
        let body = codec::marshal(&self.content_type, msg.as_ref())?;
        self.ctx
            .run(async { tx.send(Ok(body)).await.map_err(|_| send_closed()) })
            .await
    }

    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError> {
        let inbound = &mut self.inbound;
        let next = self
            .ctx
            .run(async { inbound.message().await.map_err(OrbError::from) })
            .await?;
        match next {
            Some(body) => {
                codec::unmarshal(&self.content_type, &body, into)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_send(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        Ok(())
    }
}

fn server_tls(config: &EntrypointConfig) -> Result<ServerTlsConfig, OrbError> {
    let tls = config
        .tls
        .as_ref()
        .ok_or_else(|| OrbError::BAD_REQUEST.wrap(format!("entrypoint {} needs tls", config.name)))?;
    let (cert, key) = tls.identity()?;
    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Serves the handler table over gRPC, plaintext or TLS.
pub struct GrpcEntrypoint {
    config: EntrypointConfig,
    secure: bool,
    mux: GrpcMux,
    address: RwLock<String>,
    running: Mutex<Option<Running>>,
}

impl GrpcEntrypoint {
    #[must_use]
    pub fn new(setup: EntrypointSetup) -> Self {
        let secure = setup.config.plugin == NAME_TLS || setup.config.tls.is_some();
        Self {
            address: RwLock::new(setup.config.address.clone()),
            config: setup.config,
            secure,
            mux: GrpcMux::new(setup.table),
            running: Mutex::new(None),
        }
    }

    fn server(&self) -> Result<Server, OrbError> {
        let mut server = Server::builder().max_concurrent_streams(self.config.max_concurrent_streams);
        if self.secure {
            server = server
                .tls_config(server_tls(&self.config)?)
                .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        }
        Ok(server)
    }
}

impl std::fmt::Debug for GrpcEntrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcEntrypoint")
            .field("name", &self.config.name)
            .field("address", &*self.address.read())
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Entrypoint for GrpcEntrypoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> &'static str {
        if self.secure { NAME_TLS } else { NAME }
    }

    fn register(&self, f: &RegistrationFn) {
        f(ServerMux::Grpc(&self.mux));
    }

    fn endpoints(&self) -> Vec<String> {
        self.mux.table().endpoints()
    }

    fn address(&self) -> String {
        self.address.read().clone()
    }

    async fn start(&self) -> Result<(), OrbError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let mut server = self.server()?;
        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(format!("bind {}: {e}", self.config.address)))?;
        let local = listener
            .local_addr()
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?
            .to_string();

        let routes = Routes::from(axum::Router::new().fallback_service(GrpcRouter {
            table: Arc::clone(self.mux.table()),
        }));
        let router = server.add_routes(routes);
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone().cancelled_owned();
        let span = tracing::info_span!("grpc_serve", entrypoint = %self.config.name, address = %local);
        let handle = tokio::spawn(
            async move {
                let incoming = TcpListenerStream::new(listener);
                if let Err(err) = router.serve_with_incoming_shutdown(incoming, shutdown).await {
                    tracing::error!(error = %err, "grpc server stopped with an error");
                }
            }
            .instrument(span),
        );

        tracing::debug!(entrypoint = %self.config.name, address = %local, secure = self.secure, "grpc entrypoint listening");
        *self.address.write() = local;
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<(), OrbError> {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        handle
            .await
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }
}

#[allow(clippy::unnecessary_wraps)]
fn factory(setup: EntrypointSetup) -> Result<Arc<dyn Entrypoint>, OrbError> {
    Ok(Arc::new(GrpcEntrypoint::new(setup)))
}

inventory::submit! {
    EntrypointRegistration { transports: &[NAME, NAME_TLS], factory }
}
