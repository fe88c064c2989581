//! HTTP/3 over QUIC: the `http3` client transport and the request loop the
//! entrypoint runs on its UDP socket.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use http_body_util::BodyExt as _;
use orbkit::client::{CallOptions, ClientConfig, RawResponse, RequestInfo, Transport, TransportRegistration};
use orbkit::context::Context;
use orbkit::server::EntrypointConfig;
use orbkit::stream::RawStream;
use orbkit::tls::TlsConfig;
use orbkit_errors::OrbError;
use parking_lot::Mutex;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt as _;
use tracing::Instrument as _;

use crate::tls::{self, ALPN_H3};
use crate::{MAX_BODY_SIZE, NAME_HTTP3, client};

type SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;
type ServerRequestStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> OrbError {
    OrbError::UNAVAILABLE.wrap(err)
}

fn too_large() -> OrbError {
    OrbError::http(http::StatusCode::PAYLOAD_TOO_LARGE.as_u16())
}

fn transport_config(idle_timeout: Duration) -> Result<TransportConfig, OrbError> {
    let mut transport = TransportConfig::default();
    if !idle_timeout.is_zero() {
        let idle = IdleTimeout::try_from(idle_timeout).map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        transport.max_idle_timeout(Some(idle));
    }
    Ok(transport)
}

/// The QUIC endpoint an HTTPS entrypoint serves HTTP/3 on, bound to `addr`.
///
/// # Errors
/// Returns 400 for unusable TLS material and 500 when the socket cannot be
/// bound.
pub fn server_endpoint(config: &EntrypointConfig, addr: SocketAddr) -> Result<quinn::Endpoint, OrbError> {
    let tls = config
        .tls
        .as_ref()
        .ok_or_else(|| OrbError::BAD_REQUEST.wrap(format!("entrypoint {} needs tls for http3", config.name)))?;
    let crypto = QuicServerConfig::try_from(tls::server_config(tls, ALPN_H3)?)
        .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let mut transport = transport_config(config.idle_timeout)?;
    transport.max_concurrent_bidi_streams(VarInt::from(config.max_concurrent_streams));
    server.transport_config(Arc::new(transport));
    quinn::Endpoint::server(server, addr)
        .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(format!("bind udp {addr}: {e}")))
}

/// Accepts QUIC connections until `cancel` fires, serving every request
/// through `router`.
pub async fn serve(endpoint: quinn::Endpoint, router: Router, cancel: CancellationToken, tracker: TaskTracker) {
    loop {
        let incoming = tokio::select! {
            () = cancel.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let router = router.clone();
        let cancel = cancel.clone();
        let span = tracing::debug_span!("h3_conn", peer = %incoming.remote_address());
        tracker.spawn(
            async move {
                match incoming.await {
                    Ok(conn) => serve_conn(conn, router, cancel).await,
                    Err(err) => tracing::debug!(error = %err, "quic handshake failed"),
                }
            }
            .instrument(span),
        );
    }
    endpoint.close(VarInt::from_u32(0), b"shutdown");
}

async fn serve_conn(conn: quinn::Connection, router: Router, cancel: CancellationToken) {
    let mut h3_conn = match h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(conn)).await {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!(error = %err, "h3 connection setup failed");
            return;
        }
    };
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = h3_conn.accept() => accepted,
        };
        match accepted {
            Ok(Some(resolver)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    let result = match resolver.resolve_request().await {
                        Ok((req, stream)) => serve_request(req, stream, router).await,
                        Err(err) => Err(OrbError::BAD_REQUEST.wrap(err)),
                    };
                    if let Err(err) = result {
                        tracing::debug!(error = %err, "h3 request failed");
                    }
                });
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "h3 connection closed");
                break;
            }
        }
    }
}

async fn serve_request(req: http::Request<()>, mut stream: ServerRequestStream, router: Router) -> Result<(), OrbError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.recv_data().await.map_err(unavailable)? {
        if body.len() + chunk.remaining() > MAX_BODY_SIZE {
            let resp = crate::handler::error_response(&too_large());
            return respond(&mut stream, resp).await;
        }
        body.put(chunk);
    }
    let (parts, ()) = req.into_parts();
    let req = http::Request::from_parts(parts, Body::from(body.freeze()));
    let resp = match router.oneshot(req).await {
        Ok(resp) => resp,
        Err(never) => match never {},
    };
    respond(&mut stream, resp).await
}

async fn respond(stream: &mut ServerRequestStream, resp: axum::response::Response) -> Result<(), OrbError> {
    let (parts, body) = resp.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?
        .to_bytes();
    stream
        .send_response(http::Response::from_parts(parts, ()))
        .await
        .map_err(unavailable)?;
    if !body.is_empty() {
        stream.send_data(body).await.map_err(unavailable)?;
    }
    stream.finish().await.map_err(unavailable)
}

/// HTTP/3 client transport. One QUIC connection per address, opened on
/// first use and dropped after a transport failure.
pub struct Http3Transport {
    tls: TlsConfig,
    quic: quinn::ClientConfig,
    dial_timeout: Duration,
    v4: OnceCell<quinn::Endpoint>,
    v6: OnceCell<quinn::Endpoint>,
    conns: Mutex<HashMap<String, SendRequest>>,
}

impl std::fmt::Debug for Http3Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http3Transport")
            .field("connections", &self.conns.lock().len())
            .finish_non_exhaustive()
    }
}

impl Http3Transport {
    /// # Errors
    /// Returns 400 when the TLS material is unusable.
    pub fn new(config: &ClientConfig) -> Result<Self, OrbError> {
        let tls = config.tls.clone().unwrap_or_default();
        let crypto = QuicClientConfig::try_from(tls::client_config(&tls, ALPN_H3)?)
            .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        Ok(Self {
            tls,
            quic: quinn::ClientConfig::new(Arc::new(crypto)),
            dial_timeout: config.dial_timeout,
            v4: OnceCell::new(),
            v6: OnceCell::new(),
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// The client socket for `peer`'s address family, bound on first use.
    async fn endpoint(&self, peer: SocketAddr) -> Result<&quinn::Endpoint, OrbError> {
        let (cell, bind) = if peer.is_ipv4() {
            (&self.v4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        } else {
            (&self.v6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
        };
        cell.get_or_try_init(|| async {
            let mut endpoint = quinn::Endpoint::client(bind).map_err(OrbError::from)?;
            endpoint.set_default_client_config(self.quic.clone());
            Ok(endpoint)
        })
        .await
    }

    async fn connect(&self, address: &str) -> Result<SendRequest, OrbError> {
        if let Some(send) = self.conns.lock().get(address) {
            return Ok(send.clone());
        }
        let peer = tokio::net::lookup_host(address)
            .await
            .map_err(OrbError::from)?
            .next()
            .ok_or_else(|| OrbError::UNAVAILABLE.wrap(format!("{address} did not resolve")))?;
        let name = tls::server_name(Some(&self.tls), address)?;
        let endpoint = self.endpoint(peer).await?;

        let dial = async {
            let conn = endpoint
                .connect(peer, &name.to_str())
                .map_err(unavailable)?
                .await
                .map_err(unavailable)?;
            h3::client::new(h3_quinn::Connection::new(conn)).await.map_err(unavailable)
        };
        let (mut driver, send) = if self.dial_timeout.is_zero() {
            dial.await?
        } else {
            tokio::time::timeout(self.dial_timeout, dial)
                .await
                .map_err(|_| OrbError::TIMEOUT.wrap(format!("dialing {address}")))??
        };

        let span = tracing::debug_span!("h3_client_conn", %address);
        tokio::spawn(
            async move {
                let err = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
                tracing::debug!(error = %err, "h3 connection closed");
            }
            .instrument(span),
        );
        self.conns.lock().insert(address.to_owned(), send.clone());
        Ok(send)
    }

    async fn exchange(
        &self,
        req: http::Request<()>,
        body: Bytes,
        address: &str,
    ) -> Result<(http::Response<()>, Bytes), OrbError> {
        let mut send = self.connect(address).await?;
        let mut stream = send.send_request(req).await.map_err(unavailable)?;
        stream.send_data(body).await.map_err(unavailable)?;
        stream.finish().await.map_err(unavailable)?;
        let resp = stream.recv_response().await.map_err(unavailable)?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.recv_data().await.map_err(unavailable)? {
            if buf.len() + chunk.remaining() > MAX_BODY_SIZE {
                return Err(too_large());
            }
            buf.put(chunk);
        }
        Ok((resp, buf.freeze()))
    }
}

#[async_trait]
impl Transport for Http3Transport {
    fn name(&self) -> &'static str {
        NAME_HTTP3
    }

    fn needs_codec(&self) -> bool {
        true
    }

    async fn stop(&self) -> Result<(), OrbError> {
        self.conns.lock().clear();
        for endpoint in [self.v4.get(), self.v6.get()].into_iter().flatten() {
            endpoint.close(VarInt::from_u32(0), b"client stopped");
        }
        Ok(())
    }

    async fn request(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        body: Bytes,
        opts: &CallOptions,
    ) -> Result<RawResponse, OrbError> {
        let req = client::request(ctx, "https", info, &opts.content_type)
            .body(())
            .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        let address = info.address.as_str();
        let (resp, body) = ctx
            .run(async {
                let result = self.exchange(req, body, address).await;
                if result.is_err() {
                    self.conns.lock().remove(address);
                }
                result
            })
            .await?;
        client::response(resp.status(), resp.headers(), body, &opts.content_type)
    }

    async fn stream(
        &self,
        _ctx: &Context,
        _info: &RequestInfo,
        _opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        Err(OrbError::UNIMPLEMENTED.wrap("http3 has no streaming"))
    }
}

fn factory(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(Http3Transport::new(config)?))
}

inventory::submit! {
    TransportRegistration { name: NAME_HTTP3, factory }
}
