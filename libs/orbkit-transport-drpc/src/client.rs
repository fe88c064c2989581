//! `drpc` client transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use orbkit::client::{CallOptions, ClientConfig, RawResponse, RequestInfo, Transport, TransportRegistration};
use orbkit::codec;
use orbkit::context::Context;
use orbkit::message::DynMessage;
use orbkit::metadata::{self as md, Metadata};
use orbkit::pool::{Connector, Pool, PooledConn};
use orbkit::stream::{RawStream, send_closed};
use orbkit_errors::OrbError;
use tokio::net::TcpStream;
use tracing::Instrument as _;

use crate::NAME;
use crate::conn::DrpcConn;
use crate::envelope::Envelope;
use crate::wire::{self, Kind};

/// Dials plain TCP connections for the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrpcConnector;

#[async_trait]
impl Connector for DrpcConnector {
    type Conn = DrpcConn;

    async fn connect(&self, address: &str) -> Result<DrpcConn, OrbError> {
        let span = tracing::debug_span!("drpc_connect", %address);
        async move {
            let io = TcpStream::connect(address)
                .await
                .map_err(|e| OrbError::UNAVAILABLE.wrap(format!("dial {address}: {e}")))?;
            if let Err(err) = io.set_nodelay(true) {
                tracing::debug!(error = %err, "failed to set TCP_NODELAY");
            }
            tracing::debug!("drpc connection established");
            Ok(DrpcConn::new(io))
        }
        .instrument(span)
        .await
    }
}

/// Outgoing metadata plus the payload content type, sent ahead of the
/// invoke.
fn invoke_metadata(ctx: &Context, content_type: &str) -> HashMap<String, String> {
    let mut out = ctx.outgoing().snapshot();
    out.insert(md::CONTENT_TYPE.to_owned(), content_type.to_owned());
    out
}

/// Upper bound for writing the cancel frame of an abandoned call.
const CANCEL_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// Tells the server to cancel the handler of a call the caller gave up on.
/// A connection the cancel cannot be written to is not pooled again.
async fn abandon(conn: &mut PooledConn<DrpcConn>) {
    tracing::debug!(stream = conn.stream_id(), "drpc call abandoned, cancelling the stream");
    let sent = tokio::time::timeout(CANCEL_WRITE_TIMEOUT, conn.send(Kind::Cancel, Bytes::new())).await;
    if !matches!(sent, Ok(Ok(()))) {
        conn.mark_unhealthy();
    }
}

/// Broken connections are not pooled again.
fn release_on(conn: &mut PooledConn<DrpcConn>, err: OrbError) -> OrbError {
    if conn.is_broken() {
        conn.mark_unhealthy();
    }
    err
}

async fn unary(conn: &mut DrpcConn, endpoint: &str, metadata: HashMap<String, String>, body: Bytes) -> Result<Envelope, OrbError> {
    conn.invoke(endpoint, metadata).await?;
    conn.send(Kind::Message, body).await?;
    conn.send(Kind::CloseSend, Bytes::new()).await?;
    loop {
        let frame = conn.recv().await?;
        match frame.kind {
            Kind::Message => return Envelope::from_frame(&frame.data),
            Kind::Error => return Err(wire::decode_error(&frame.data)),
            Kind::Close | Kind::Cancel => {
                return Err(OrbError::INTERNAL_SERVER_ERROR.wrap("drpc stream closed without a response"));
            }
            Kind::CloseSend | Kind::Invoke | Kind::InvokeMetadata => {}
        }
    }
}

/// Client transport over pooled DRPC connections.
#[derive(Debug)]
pub struct DrpcTransport {
    pool: Pool<DrpcConnector>,
}

impl DrpcTransport {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            pool: Pool::new(DrpcConnector, config.pool.clone()),
        }
    }
}

#[async_trait]
impl Transport for DrpcTransport {
    fn name(&self) -> &'static str {
        NAME
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
        let mut conn = self.pool.get(ctx, &info.address).await?;
        let metadata = invoke_metadata(ctx, &opts.content_type);
        let result = ctx.run(unary(&mut conn, &info.endpoint, metadata, body)).await;
        if result.is_err() && ctx.err().is_some() {
            abandon(&mut conn).await;
        }

        let envelope = result.map_err(|err| release_on(&mut conn, err))?;
        let body = Bytes::copy_from_slice(envelope.payload()?);
        Ok(RawResponse {
            content_type: opts.content_type.clone(),
            body,
            metadata: envelope.metadata,
        })
    }

    async fn stream(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        let mut conn = self.pool.get(ctx, &info.address).await?;
        let metadata = invoke_metadata(ctx, &opts.content_type);
        if let Err(err) = ctx.run(conn.invoke(&info.endpoint, metadata)).await {
            return Err(release_on(&mut conn, err));
        }
        Ok(Box::new(DrpcClientStream {
            ctx: ctx.clone(),
            conn,
            content_type: opts.content_type.clone(),
            response_metadata: opts.response_metadata.clone(),
            send_closed: false,
            finished: false,
        }))
    }
}

struct DrpcClientStream {
    ctx: Context,
    conn: PooledConn<DrpcConn>,
    content_type: String,
    response_metadata: Option<Metadata>,
    send_closed: bool,
    finished: bool,
}

impl DrpcClientStream {
    fn fail(&mut self, err: OrbError) -> OrbError {
        self.finished = true;
        self.send_closed = true;
        release_on(&mut self.conn, err)
    }
}

#[async_trait]
impl RawStream for DrpcClientStream {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError> {
        if self.send_closed {
            return Err(send_closed());
        }
        let body = codec::marshal(&self.content_type, msg.as_ref())?;
        match self.conn.send(Kind::Message, body).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError> {
        while !self.finished {
            let frame = match self.conn.recv().await {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err)),
            };
            match frame.kind {
                Kind::Message => {
                    let envelope = Envelope::from_frame(&frame.data)?;
                    if let Some(md) = &self.response_metadata {
                        md.extend(envelope.metadata.iter());
                    }
                    envelope.decode_into(&self.content_type, into)?;
                    return Ok(true);
                }
                Kind::Error => {
                    self.finished = true;
                    return Err(wire::decode_error(&frame.data));
                }
                Kind::Close | Kind::CloseSend | Kind::Cancel => self.finished = true,
                Kind::Invoke | Kind::InvokeMetadata => {}
            }
        }
        Ok(false)
    }

    async fn close_send(&mut self) -> Result<(), OrbError> {
        if self.send_closed {
            return Ok(());
        }
        self.send_closed = true;
        match self.conn.send(Kind::CloseSend, Bytes::new()).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn close(&mut self) -> Result<(), OrbError> {
        let was_finished = self.finished;
        self.send_closed = true;
        self.finished = true;
        if was_finished {
            return Ok(());
        }
        match self.conn.send(Kind::Close, Bytes::new()).await {
            Ok(()) => Ok(()),
            Err(err) => Err(release_on(&mut self.conn, err)),
        }
    }
}

impl Drop for DrpcClientStream {
    /// A stream dropped mid-flight leaves its server handler running, so the
    /// connection is closed instead of pooled; the server cancels the handler
    /// when the connection goes away.
    fn drop(&mut self) {
        if !self.finished {
            self.conn.mark_unhealthy();
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn factory(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(DrpcTransport::new(config)))
}

inventory::submit! {
    TransportRegistration { name: NAME, factory }
}
