//! Client side of one DRPC connection.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use orbkit_errors::OrbError;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::envelope::InvokeMetadata;
use crate::wire::{Frame, FrameCodec, Kind, WireError};

/// A framed connection that runs one stream at a time.
///
/// Starting a stream abandons the previous one: the server cancels it, and
/// frames that still arrive for it are dropped here.
pub struct DrpcConn {
    framed: Framed<TcpStream, FrameCodec>,
    stream: u64,
    message: u64,
    broken: bool,
}

impl DrpcConn {
    #[must_use]
    pub fn new(io: TcpStream) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec),
            stream: 0,
            message: 0,
            broken: false,
        }
    }

    /// Id of the stream started last.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.stream
    }

    /// Whether a read or write failed; such a connection must not be reused.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn check<T>(&mut self, result: Result<T, WireError>) -> Result<T, OrbError> {
        result.map_err(|err| {
            self.broken = true;
            OrbError::from(err)
        })
    }

    fn frame(&mut self, kind: Kind, data: Bytes) -> Frame {
        self.message += 1;
        Frame::new(self.stream, self.message, kind, data)
    }

    /// Starts a stream for `rpc`, sending `metadata` ahead of the invoke.
    ///
    /// # Errors
    /// Returns 503 when the connection is broken.
    pub async fn invoke(&mut self, rpc: &str, metadata: HashMap<String, String>) -> Result<u64, OrbError> {
        self.stream += 1;
        self.message = 0;
        let md = self.frame(Kind::InvokeMetadata, InvokeMetadata::to_frame(metadata));
        let invoke = self.frame(Kind::Invoke, Bytes::copy_from_slice(rpc.as_bytes()));
        let sent = async {
            self.framed.feed(md).await?;
            self.framed.feed(invoke).await?;
            self.framed.flush().await
        }
        .await;
        self.check(sent)?;
        Ok(self.stream)
    }

    /// Sends one frame on the current stream.
    ///
    /// # Errors
    /// Returns 503 when the connection is broken.
    pub async fn send(&mut self, kind: Kind, data: Bytes) -> Result<(), OrbError> {
        let frame = self.frame(kind, data);
        let sent = self.framed.send(frame).await;
        self.check(sent)
    }

    /// Next frame of the current stream.
    ///
    /// # Errors
    /// Returns 503 when the peer hung up or the connection broke, 500 on a
    /// framing error.
    pub async fn recv(&mut self) -> Result<Frame, OrbError> {
        loop {
            match self.framed.next().await {
                None => {
                    self.broken = true;
                    return Err(OrbError::UNAVAILABLE.wrap("drpc connection closed by peer"));
                }
                Some(Err(err)) => return self.check(Err(err)),
                Some(Ok(frame)) if frame.stream != self.stream => {
                    tracing::trace!(stale = frame.stream, current = self.stream, "dropping frame of a finished stream");
                }
                Some(Ok(frame)) => return Ok(frame),
            }
        }
    }
}

impl std::fmt::Debug for DrpcConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrpcConn")
            .field("peer", &self.framed.get_ref().peer_addr().ok())
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
