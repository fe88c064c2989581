//! The DRPC entrypoint.
//!
//! Each accepted connection gets a reader loop that demultiplexes frames
//! into the current stream and a writer task that serializes replies. A
//! stream's handler runs in its own task; a new invoke on the same
//! connection, a close frame or the entrypoint stopping cancels it through
//! its context.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use orbkit::codec::{self, MIME_PROTO};
use orbkit::context::Context;
use orbkit::message::DynMessage;
use orbkit::metadata::{self as md, Metadata, split_endpoint};
use orbkit::server::{
    DrpcMux, Entrypoint, EntrypointConfig, EntrypointRegistration, EntrypointSetup, HandlerTable,
    Method, RegistrationFn, ServerMux,
};
use orbkit::stream::{RawStream, send_closed};
use orbkit_errors::OrbError;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::envelope::{Envelope, InvokeMetadata};
use crate::wire::{self, Frame, FrameCodec, Kind};
use crate::{NAME, STREAM_BUFFER};

/// Writes frames of one stream through the connection's writer task.
#[derive(Clone)]
struct FrameWriter {
    stream: u64,
    message: Arc<AtomicU64>,
    out: mpsc::Sender<Frame>,
}

impl FrameWriter {
    async fn send(&self, kind: Kind, data: Bytes) -> Result<(), OrbError> {
        let message = self.message.fetch_add(1, Ordering::Relaxed) + 1;
        self.out
            .send(Frame::new(self.stream, message, kind, data))
            .await
            .map_err(|_| OrbError::UNAVAILABLE.wrap("drpc connection closed"))
    }
}

/// The stream a connection currently routes message frames to.
struct Current {
    stream: u64,
    inbound: Option<mpsc::Sender<Bytes>>,
    ctx: Context,
}

impl Current {
    fn matches(&self, frame: &Frame) -> bool {
        self.stream == frame.stream
    }
}

/// Everything a handler task needs for one invoke.
struct Call {
    endpoint: String,
    ctx: Context,
    content_type: String,
    inbound: mpsc::Receiver<Bytes>,
    writer: FrameWriter,
}

/// Handler context: DRPC metadata becomes incoming metadata, plus the
/// service and method parsed from the rpc name.
fn server_context(metadata: HashMap<String, String>, endpoint: &str) -> (Context, String) {
    let incoming = Metadata::from_map(metadata);
    let content_type = incoming
        .get(md::CONTENT_TYPE)
        .map_or_else(|| MIME_PROTO.to_owned(), |ct| codec::normalize(&ct));
    incoming.set(md::CONTENT_TYPE, content_type.as_str());
    let (service, method) = split_endpoint(endpoint);
    incoming.set(md::SERVICE, service);
    incoming.set(md::METHOD, method);
    (Context::background().with_incoming(incoming), content_type)
}

async fn serve_conn(table: Arc<HandlerTable>, io: TcpStream, shutdown: CancellationToken, tracker: TaskTracker) {
    let (mut sink, mut frames) = Framed::new(io, FrameCodec).split();
    let (out, mut rx) = mpsc::channel::<Frame>(STREAM_BUFFER);
    let writer = tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    tracing::debug!(error = %err, "drpc write failed");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut current: Option<Current> = None;
    let mut pending_metadata = HashMap::new();
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "drpc read failed");
                break;
            }
            None => break,
        };

        match frame.kind {
            Kind::InvokeMetadata => pending_metadata = InvokeMetadata::from_frame(&frame.data),
            Kind::Invoke => {
                if let Some(prev) = current.take() {
                    prev.ctx.cancel();
                }
                let endpoint = String::from_utf8_lossy(&frame.data).into_owned();
                let (ctx, content_type) = server_context(std::mem::take(&mut pending_metadata), &endpoint);
                let (tx, inbound) = mpsc::channel(STREAM_BUFFER);
                current = Some(Current {
                    stream: frame.stream,
                    inbound: Some(tx),
                    ctx: ctx.clone(),
                });
                let call = Call {
                    endpoint,
                    ctx,
                    content_type,
                    inbound,
                    writer: FrameWriter {
                        stream: frame.stream,
                        message: Arc::new(AtomicU64::new(0)),
                        out: out.clone(),
                    },
                };
                let span = tracing::debug_span!("drpc_rpc", endpoint = %call.endpoint, stream = frame.stream);
                tracker.spawn(handle_rpc(Arc::clone(&table), call).instrument(span));
            }
            Kind::Message => {
                let Some(cur) = current.as_ref().filter(|c| c.matches(&frame)) else {
                    continue;
                };
                if let Some(tx) = &cur.inbound {
                    tokio::select! {
                        () = cur.ctx.cancellation_token().cancelled() => {}
                        sent = tx.send(frame.data) => {
                            if sent.is_err() {
                                tracing::trace!("handler stopped reading");
                            }
                        }
                    }
                }
            }
            Kind::CloseSend => {
                if let Some(cur) = current.as_mut().filter(|c| c.matches(&frame)) {
                    cur.inbound = None;
                }
            }
            Kind::Close | Kind::Cancel | Kind::Error => {
                if let Some(cur) = current.take_if(|c| c.matches(&frame)) {
                    cur.ctx.cancel();
                }
            }
        }
    }

    if let Some(cur) = current.take() {
        cur.ctx.cancel();
    }
    drop(out);
    if writer.await.is_err() {
        tracing::debug!("drpc writer task panicked");
    }
}

async fn handle_rpc(table: Arc<HandlerTable>, call: Call) {
    let Call {
        endpoint,
        ctx,
        content_type,
        mut inbound,
        writer,
    } = call;

    let result = match table.method(&endpoint) {
        Some(Method::Unary { .. }) => unary(&table, &ctx, &endpoint, &content_type, &mut inbound, &writer).await,
        Some(Method::Stream(handler)) => {
            let stream = DrpcServerStream {
                ctx: ctx.clone(),
                inbound,
                writer: writer.clone(),
                content_type,
                send_closed: false,
            };
            handler(Box::new(stream)).await
        }
        None => Err(OrbError::NOT_FOUND.wrap(format!("unknown rpc {endpoint}"))),
    };

    if ctx.is_cancelled() {
        tracing::debug!("drpc stream cancelled by the client");
        return;
    }
    let reply = match result {
        Ok(()) => writer.send(Kind::Close, Bytes::new()).await,
        Err(err) => {
            tracing::debug!(code = err.code(), error = %err, "drpc handler failed");
            writer.send(Kind::Error, wire::encode_error(&err)).await
        }
    };
    if reply.is_err() {
        tracing::trace!("drpc client gone before the reply");
    }
}

async fn unary(
    table: &HandlerTable,
    ctx: &Context,
    endpoint: &str,
    content_type: &str,
    inbound: &mut mpsc::Receiver<Bytes>,
    writer: &FrameWriter,
) -> Result<(), OrbError> {
    let body = ctx
        .run(async { Ok::<_, OrbError>(inbound.recv().await) })
        .await?
        .ok_or_else(|| OrbError::BAD_REQUEST.wrap("drpc stream closed before the request"))?;
    let req = table.decode_request(endpoint, content_type, &body)?;
    let resp = table.invoke_unary(ctx, endpoint, req).await?;
    let envelope = Envelope::wrap(content_type, resp.as_ref(), ctx.outgoing().snapshot())?;
    writer.send(Kind::Message, envelope.to_frame()).await
}

/// Handler side of a DRPC stream.
///
/// Every sent message is wrapped in an [`Envelope`] carrying the handler's
/// outgoing metadata as it is at that moment.
struct DrpcServerStream {
    ctx: Context,
    inbound: mpsc::Receiver<Bytes>,
    writer: FrameWriter,
    content_type: String,
    send_closed: bool,
}

#[async_trait]
impl RawStream for DrpcServerStream {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError> {
        if self.send_closed {
            return Err(send_closed());
        }
        let envelope = Envelope::wrap(&self.content_type, msg.as_ref(), self.ctx.outgoing().snapshot())?;
        self.writer.send(Kind::Message, envelope.to_frame()).await
    }

    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError> {
        match self.inbound.recv().await {
            Some(body) => {
                codec::unmarshal(&self.content_type, &body, into)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_send(&mut self) -> Result<(), OrbError> {
        self.send_closed = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OrbError> {
        self.send_closed = true;
        self.inbound.close();
        Ok(())
    }
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Serves the handler table over DRPC on one TCP listener.
pub struct DrpcEntrypoint {
    config: EntrypointConfig,
    mux: DrpcMux,
    address: RwLock<String>,
    running: Mutex<Option<Running>>,
}

impl DrpcEntrypoint {
    #[must_use]
    pub fn new(setup: EntrypointSetup) -> Self {
        Self {
            address: RwLock::new(setup.config.address.clone()),
            config: setup.config,
            mux: DrpcMux::new(setup.table),
            running: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for DrpcEntrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrpcEntrypoint")
            .field("name", &self.config.name)
            .field("address", &*self.address.read())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    table: Arc<HandlerTable>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (io, peer) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "drpc accept failed");
                continue;
            }
        };
        if let Err(err) = io.set_nodelay(true) {
            tracing::debug!(error = %err, "failed to set TCP_NODELAY");
        }
        let span = tracing::debug_span!("drpc_conn", %peer);
        let conn = serve_conn(Arc::clone(&table), io, cancel.child_token(), tracker.clone());
        tracker.spawn(
            async move {
                conn.await;
                drop(permit);
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Entrypoint for DrpcEntrypoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> &'static str {
        NAME
    }

    fn register(&self, f: &RegistrationFn) {
        f(ServerMux::Drpc(&self.mux));
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

        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(format!("bind {}: {e}", self.config.address)))?;
        let local = listener
            .local_addr()
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?
            .to_string();

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let connections = usize::try_from(self.config.max_concurrent_streams.max(1)).unwrap_or(usize::MAX);
        let limit = Arc::new(Semaphore::new(connections));
        let span = tracing::info_span!("drpc_serve", entrypoint = %self.config.name, address = %local);
        tracker.spawn(
            accept_loop(listener, Arc::clone(self.mux.table()), limit, cancel.clone(), tracker.clone())
                .instrument(span),
        );

        tracing::debug!(entrypoint = %self.config.name, address = %local, "drpc entrypoint listening");
        *self.address.write() = local;
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
    Ok(Arc::new(DrpcEntrypoint::new(setup)))
}

inventory::submit! {
    EntrypointRegistration { transports: &[NAME], factory }
}
