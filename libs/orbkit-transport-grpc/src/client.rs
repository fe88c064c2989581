//! `grpc` and `grpcs` client transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use orbkit::client::{CallOptions, ClientConfig, RawResponse, RequestInfo, Transport, TransportRegistration};
use orbkit::codec;
use orbkit::context::Context;
use orbkit::message::DynMessage;
use orbkit::metadata::Metadata;
use orbkit::pool::{Connector, Pool, PooledConn};
use orbkit::stream::{RawStream, send_closed};
use orbkit::tls::TlsConfig;
use orbkit_errors::OrbError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tonic::client::Grpc;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::Instrument as _;

use crate::codec::RawCodec;
use crate::metadata;
use crate::{NAME, NAME_TLS, STREAM_BUFFER};

/// Dials tonic channels for the pool.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    tls: Option<ClientTlsConfig>,
    connect_timeout: Duration,
}

impl GrpcConnector {
    /// A plaintext connector, or a TLS one when `tls` is given.
    ///
    /// # Errors
    /// Returns 500 when the TLS material cannot be read.
    pub fn new(tls: Option<&TlsConfig>, connect_timeout: Duration) -> Result<Self, OrbError> {
        Ok(Self {
            tls: tls.map(client_tls).transpose()?,
            connect_timeout,
        })
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, OrbError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);
        if !self.connect_timeout.is_zero() {
            endpoint = endpoint.connect_timeout(self.connect_timeout);
        }
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        }
        Ok(endpoint)
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Conn = Channel;

    async fn connect(&self, address: &str) -> Result<Channel, OrbError> {
        let endpoint = self.endpoint(address)?;
        let span = tracing::debug_span!("grpc_connect", %address, tls = self.tls.is_some());
        async move {
            let channel = endpoint
                .connect()
                .await
                .map_err(|e| OrbError::UNAVAILABLE.wrap(e))?;
            tracing::debug!("grpc channel connected");
            Ok(channel)
        }
        .instrument(span)
        .await
    }
}

fn client_tls(tls: &TlsConfig) -> Result<ClientTlsConfig, OrbError> {
    let mut out = ClientTlsConfig::new();
    if let Some(ca) = tls.ca()? {
        out = out.ca_certificate(Certificate::from_pem(ca));
    }
    if let Some(name) = &tls.server_name {
        out = out.domain_name(name.clone());
    }
    if let (Some(cert), Some(key)) = (tls.cert_chain()?, tls.private_key()?) {
        out = out.identity(Identity::from_pem(cert, key));
    }
    Ok(out)
}

fn path(endpoint: &str) -> Result<PathAndQuery, OrbError> {
    PathAndQuery::try_from(endpoint).map_err(|e| OrbError::BAD_REQUEST.wrap(e))
}

/// Outgoing metadata, payload content type and deadline onto a request.
fn prepare<T>(ctx: &Context, request: &mut tonic::Request<T>, content_type: &str) {
    metadata::write(request.metadata_mut(), &ctx.outgoing().snapshot());
    metadata::set_content_type(request.metadata_mut(), content_type);
    if let Some(remaining) = ctx.remaining() {
        request.set_timeout(remaining);
    }
}

/// Client transport over pooled tonic channels.
#[derive(Debug)]
pub struct GrpcTransport {
    name: &'static str,
    pool: Pool<GrpcConnector>,
}

impl GrpcTransport {
    /// # Errors
    /// Returns 500 when `secure` and the TLS material cannot be read.
    pub fn new(config: &ClientConfig, secure: bool) -> Result<Self, OrbError> {
        let tls = if secure {
            Some(config.tls.clone().unwrap_or_default())
        } else {
            None
        };
        let connector = GrpcConnector::new(tls.as_ref(), config.dial_timeout)?;
        Ok(Self {
            name: if secure { NAME_TLS } else { NAME },
            pool: Pool::new(connector, config.pool.clone()),
        })
    }

    async fn conn(&self, ctx: &Context, address: &str) -> Result<PooledConn<Channel>, OrbError> {
        self.pool.get(ctx, address).await
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn needs_codec(&self) -> bool {
        true
    }

    async fn stop(&self) -> Result<(), OrbError> {
        self.pool.close();
        Ok(())
    }

    async fn request(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        body: Bytes,
        opts: &CallOptions,
    ) -> Result<RawResponse, OrbError> {
        let path = path(&info.endpoint)?;
        let mut conn = self.conn(ctx, &info.address).await?;
        let mut request = tonic::Request::new(body);
        prepare(ctx, &mut request, &opts.content_type);

        let mut grpc = Grpc::new(Channel::clone(&conn));
        let result = ctx
            .run(async move {
                grpc.ready().await.map_err(|e| OrbError::UNAVAILABLE.wrap(e))?;
                grpc.unary(request, path, RawCodec).await.map_err(OrbError::from)
            })
            .await;

        match result {
            Ok(resp) => Ok(RawResponse {
                content_type: opts.content_type.clone(),
                metadata: metadata::read(resp.metadata()),
                body: resp.into_inner(),
            }),
            Err(err) => {
                if err.code() == OrbError::UNAVAILABLE.code() {
                    conn.mark_unhealthy();
                }
                Err(err)
            }
        }
    }

    async fn stream(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        let path = path(&info.endpoint)?;
        let conn = self.conn(ctx, &info.address).await?;
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        prepare(ctx, &mut request, &opts.content_type);

        let mut grpc = Grpc::new(Channel::clone(&conn));
        let resp = ctx
            .run(async move {
                grpc.ready().await.map_err(|e| OrbError::UNAVAILABLE.wrap(e))?;
                grpc.streaming(request, path, RawCodec).await.map_err(OrbError::from)
            })
            .await?;
        if let Some(md) = &opts.response_metadata {
            md.extend(metadata::read(resp.metadata()));
        }

        Ok(Box::new(GrpcClientStream {
            ctx: ctx.clone(),
            tx: Some(tx),
            inbound: Some(resp.into_inner()),
            content_type: opts.content_type.clone(),
            response_metadata: opts.response_metadata.clone(),
            _conn: conn,
        }))
    }
}

struct GrpcClientStream {
    ctx: Context,
    tx: Option<mpsc::Sender<Bytes>>,
    inbound: Option<Streaming<Bytes>>,
    content_type: String,
    response_metadata: Option<Metadata>,
    /// Holds the pool slot for the stream's lifetime.
    _conn: PooledConn<Channel>,
}

#[async_trait]
impl RawStream for GrpcClientStream {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError> {
        let Some(tx) = &self.tx else {
            return Err(send_closed());
        };
        let body = codec::marshal(&self.content_type, msg.as_ref())?;
        self.ctx
            .run(async { tx.send(body).await.map_err(|_| send_closed()) })
            .await
    }

    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Ok(false);
        };
        let next = self
            .ctx
            .run(async { inbound.message().await.map_err(OrbError::from) })
            .await?;
        if let Some(body) = next {
            codec::unmarshal(&self.content_type, &body, into)?;
            return Ok(true);
        }
        if let Some(md) = &self.response_metadata
            && let Ok(Some(trailers)) = inbound.trailers().await
        {
            md.extend(metadata::read(&trailers));
        }
        Ok(false)
    }

    async fn close_send(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        self.inbound = None;
        Ok(())
    }
}

fn plaintext(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(GrpcTransport::new(config, false)?))
}

fn secure(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(GrpcTransport::new(config, true)?))
}

inventory::submit! {
    TransportRegistration { name: NAME, factory: plaintext }
}

inventory::submit! {
    TransportRegistration { name: NAME_TLS, factory: secure }
}
