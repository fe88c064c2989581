use async_trait::async_trait;
use orbkit_errors::OrbError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::message::DynMessage;
use crate::metadata::Metadata;
use crate::stream::{RawStream, send_closed};

/// Messages buffered per direction before `send` waits.
const BUFFER: usize = 32;

type Frames = mpsc::Sender<Box<dyn DynMessage>>;

/// One half of an in-process stream.
pub(super) struct MemoryStream {
    ctx: Context,
    tx: Option<Frames>,
    rx: mpsc::Receiver<Box<dyn DynMessage>>,
    done: CancellationToken,
    /// Client half only: the handler's error, delivered before the
    /// server-to-client channel closes.
    errors: Option<mpsc::Receiver<OrbError>>,
    /// Client half only: the handler's outgoing map and where to copy it.
    peer_outgoing: Option<(Metadata, Metadata)>,
}

/// Server side bookkeeping kept alive until the handler's error is queued.
pub(super) struct ServerEnd {
    pub(super) stream: MemoryStream,
    pub(super) errors: mpsc::Sender<OrbError>,
    pub(super) keep_open: Frames,
}

/// Wires a client half on `client_ctx` to a server half on `server_ctx`.
pub(super) fn pair(
    client_ctx: Context,
    server_ctx: Context,
    response_metadata: Option<Metadata>,
) -> (MemoryStream, ServerEnd) {
    let (c2s_tx, c2s_rx) = mpsc::channel(BUFFER);
    let (s2c_tx, s2c_rx) = mpsc::channel(BUFFER);
    let (err_tx, err_rx) = mpsc::channel(1);
    let done = CancellationToken::new();

    let peer_outgoing = response_metadata.map(|dst| (server_ctx.outgoing().clone(), dst));
    let client = MemoryStream {
        ctx: client_ctx,
        tx: Some(c2s_tx),
        rx: s2c_rx,
        done: done.clone(),
        errors: Some(err_rx),
        peer_outgoing,
    };
    let server = MemoryStream {
        ctx: server_ctx,
        tx: Some(s2c_tx.clone()),
        rx: c2s_rx,
        done,
        errors: None,
        peer_outgoing: None,
    };
    (
        client,
        ServerEnd {
            stream: server,
            errors: err_tx,
            keep_open: s2c_tx,
        },
    )
}

impl MemoryStream {
    fn merge_peer_metadata(&self) {
        if let Some((src, dst)) = &self.peer_outgoing {
            dst.extend(src.snapshot());
        }
    }
}

#[async_trait]
impl RawStream for MemoryStream {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError> {
        let Some(tx) = &self.tx else {
            return Err(send_closed());
        };
        tokio::select! {
            biased;
            () = self.done.cancelled() => Err(send_closed()),
            res = tx.send(msg) => res.map_err(|_| send_closed()),
        }
    }

    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError> {
        let msg = tokio::select! {
            biased;
            () = self.done.cancelled() => return Ok(false),
            msg = self.rx.recv() => msg,
        };
        self.merge_peer_metadata();
        if let Some(msg) = msg {
            into.assign(msg)?;
            return Ok(true);
        }
        match self.errors.as_mut().map(mpsc::Receiver::try_recv) {
            Some(Ok(err)) => Err(err),
            _ => Ok(false),
        }
    }

    async fn close_send(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OrbError> {
        self.tx = None;
        self.done.cancel();
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::message::testing::Ping;

    fn ping(name: &str) -> Box<dyn DynMessage> {
        Box::new(Ping { name: name.to_owned() })
    }

    #[tokio::test]
    async fn test_fifo_then_eof_after_close_send() {
        let (mut client, server) = pair(Context::background(), Context::background(), None);
        let ServerEnd { stream: mut server, .. } = server;
        for name in ["a", "b", "c"] {
            client.send(ping(name)).await.unwrap();
        }
        client.close_send().await.unwrap();
        assert_eq!(client.send(ping("late")).await.unwrap_err().message(), "send closed");

        let mut got = Vec::new();
        let mut into = Ping::default();
        while server.recv(&mut into).await.unwrap() {
            got.push(into.name.clone());
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_client() {
        let (mut client, server) = pair(Context::background(), Context::background(), None);
        let ServerEnd { stream, errors, keep_open } = server;
        drop(stream);
        errors.send(OrbError::UNAUTHORIZED).await.unwrap();
        drop(keep_open);
        let err = client.recv(&mut Ping::default()).await.unwrap_err();
        assert_eq!(err.code(), 401);
    }

    #[tokio::test]
    async fn test_close_unblocks_peer() {
        let (mut client, server) = pair(Context::background(), Context::background(), None);
        let ServerEnd { stream: mut server, .. } = server;
        let waiter = tokio::spawn(async move { server.recv(&mut Ping::default()).await });
        client.close().await.unwrap();
        assert!(!waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_server_metadata_is_copied_on_recv() {
        let server_ctx = Context::background();
        let response = Metadata::new();
        let (mut client, server) = pair(Context::background(), server_ctx.clone(), Some(response.clone()));
        let ServerEnd { stream: mut server, .. } = server;
        server_ctx.outgoing().set("tracing-id", "t1");
        server.send(ping("x")).await.unwrap();
        assert!(client.recv(&mut Ping::default()).await.unwrap());
        assert_eq!(response.get("tracing-id").as_deref(), Some("t1"));
    }
}
