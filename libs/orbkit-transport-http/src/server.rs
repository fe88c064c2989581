//! The HTTP entrypoint.
//!
//! A TCP listener, TLS-terminated for `https` and `http3`, serving HTTP/1.1
//! and HTTP/2 through hyper's auto-detecting connection builder. With HTTP/3
//! enabled a QUIC endpoint is bound to the same port over UDP and serves the
//! same router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use hyper_util::service::TowerToHyperService;
use orbkit::server::{
    Entrypoint, EntrypointConfig, EntrypointRegistration, EntrypointSetup, HttpMux, RegistrationFn, ServerMux,
};
use orbkit_errors::OrbError;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::tls::{self, ALPN_H2_HTTP1};
use crate::{NAME_H2C, NAME_HTTP, NAME_HTTP3, NAME_HTTPS, handler, http3};

/// How long open connections get to finish their requests on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Serves the handler table over `http`, `https`, `h2c` or `http3`.
pub struct HttpEntrypoint {
    config: EntrypointConfig,
    transport: &'static str,
    mux: HttpMux,
    address: RwLock<String>,
    running: Mutex<Option<Running>>,
}

impl HttpEntrypoint {
    #[must_use]
    pub fn new(setup: EntrypointSetup) -> Self {
        let transport = match setup.config.plugin.as_str() {
            NAME_HTTPS => NAME_HTTPS,
            NAME_H2C => NAME_H2C,
            NAME_HTTP3 => NAME_HTTP3,
            _ if setup.config.tls.is_some() => NAME_HTTPS,
            _ => NAME_HTTP,
        };
        Self {
            address: RwLock::new(setup.config.address.clone()),
            config: setup.config,
            transport,
            mux: HttpMux::new(setup.table),
            running: Mutex::new(None),
        }
    }

    fn secure(&self) -> bool {
        matches!(self.transport, NAME_HTTPS | NAME_HTTP3)
    }

    fn serves_http3(&self) -> bool {
        self.transport == NAME_HTTP3 || (self.secure() && self.config.http3)
    }

    fn acceptor(&self) -> Result<Option<TlsAcceptor>, OrbError> {
        if !self.secure() {
            return Ok(None);
        }
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| OrbError::BAD_REQUEST.wrap(format!("entrypoint {} needs tls", self.config.name)))?;
        let config = tls::server_config(tls, ALPN_H2_HTTP1)?;
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    fn builder(&self) -> auto::Builder<TokioExecutor> {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        if !self.config.read_timeout.is_zero() {
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(self.config.read_timeout);
        }
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_concurrent_streams(self.config.max_concurrent_streams);
        if self.transport == NAME_H2C {
            builder = builder.http2_only();
        }
        builder
    }
}

impl std::fmt::Debug for HttpEntrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEntrypoint")
            .field("name", &self.config.name)
            .field("transport", &self.transport)
            .field("address", &*self.address.read())
            .finish_non_exhaustive()
    }
}

/// Per-connection state of the accept loop.
#[derive(Clone)]
struct Serve {
    router: Router,
    acceptor: Option<TlsAcceptor>,
    builder: auto::Builder<TokioExecutor>,
    force: CancellationToken,
}

impl Serve {
    async fn connection(self, io: TcpStream, watcher: Watcher) {
        let Self { router, acceptor, builder, force } = self;
        let service = TowerToHyperService::new(router);
        let served = async {
            match acceptor {
                Some(acceptor) => {
                    let tls = match acceptor.accept(io).await {
                        Ok(tls) => tls,
                        Err(err) => {
                            tracing::debug!(error = %err, "tls handshake failed");
                            return Ok(());
                        }
                    };
                    let conn = builder.serve_connection(TokioIo::new(tls), service).into_owned();
                    watcher.watch(conn).await
                }
                None => {
                    let conn = builder.serve_connection(TokioIo::new(io), service).into_owned();
                    watcher.watch(conn).await
                }
            }
        };
        tokio::select! {
            result = served => {
                if let Err(err) = result {
                    tracing::debug!(error = %err, "http connection ended with an error");
                }
            }
            () = force.cancelled() => tracing::debug!("http connection dropped at shutdown"),
        }
    }
}

async fn accept_loop(listener: TcpListener, serve: Serve, cancel: CancellationToken, tracker: TaskTracker) {
    let graceful = GracefulShutdown::new();
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (io, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = io.set_nodelay(true) {
            tracing::trace!(error = %err, "set_nodelay failed");
        }
        let span = tracing::debug_span!("http_conn", %peer);
        tracker.spawn(serve.clone().connection(io, graceful.watcher()).instrument(span));
    }
    drop(listener);
    if tokio::time::timeout(SHUTDOWN_GRACE, graceful.shutdown()).await.is_err() {
        tracing::warn!("http connections still open after the grace period, dropping them");
        serve.force.cancel();
    }
}

#[async_trait]
impl Entrypoint for HttpEntrypoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> &'static str {
        self.transport
    }

    fn register(&self, f: &RegistrationFn) {
        f(ServerMux::Http(&self.mux));
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

        let acceptor = self.acceptor()?;
        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(format!("bind {}: {e}", self.config.address)))?;
        let local: SocketAddr = listener
            .local_addr()
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?;
        let quic = if self.serves_http3() {
            Some(http3::server_endpoint(&self.config, local)?)
        } else {
            None
        };

        let router = handler::router(Arc::clone(self.mux.table()), &self.config);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let serve = Serve {
            router: router.clone(),
            acceptor,
            builder: self.builder(),
            force: CancellationToken::new(),
        };
        let span = tracing::info_span!("http_serve", entrypoint = %self.config.name, address = %local);
        tracker.spawn(accept_loop(listener, serve, cancel.clone(), tracker.clone()).instrument(span.clone()));
        if let Some(endpoint) = quic {
            tracker.spawn(http3::serve(endpoint, router, cancel.clone(), tracker.clone()).instrument(span));
        }

        tracing::debug!(
            entrypoint = %self.config.name,
            address = %local,
            transport = self.transport,
            http3 = self.serves_http3(),
            "http entrypoint listening"
        );
        *self.address.write() = local.to_string();
        *running = Some(Running { cancel, tracker });
        Ok(())
    }

    async fn stop(&self) -> Result<(), OrbError> {
        let Some(Running { cancel, tracker }) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

#[allow(clippy::unnecessary_wraps)]
fn factory(setup: EntrypointSetup) -> Result<Arc<dyn Entrypoint>, OrbError> {
    Ok(Arc::new(HttpEntrypoint::new(setup)))
}

inventory::submit! {
    EntrypointRegistration { transports: &[NAME_HTTP, NAME_HTTPS, NAME_H2C, NAME_HTTP3], factory }
}
