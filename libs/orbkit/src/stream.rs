//! Bidirectional streams.
//!
//! Transports implement the object-safe [`RawStream`]; callers and
//! generated handlers use the typed [`ClientStream`] and [`ServerStream`]
//! wrappers. Every typed operation races against the stream's context, so a
//! cancelled or expired context unblocks pending sends and receives.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use orbkit_errors::OrbError;

use crate::context::Context;
use crate::message::{DynMessage, Message};

/// The error returned by `send` after `close_send`.
#[must_use]
pub fn send_closed() -> OrbError {
    OrbError::new(OrbError::BAD_REQUEST.code(), "send closed")
}

#[async_trait]
pub trait RawStream: Send {
    fn context(&self) -> &Context;

    /// # Errors
    /// Fails with [`send_closed`] after [`RawStream::close_send`], or with
    /// the transport's error.
    async fn send(&mut self, msg: Box<dyn DynMessage>) -> Result<(), OrbError>;

    /// Receives the next message into `into`. `Ok(false)` is end of stream.
    ///
    /// # Errors
    /// Returns the remote error or the transport's error.
    async fn recv(&mut self, into: &mut dyn DynMessage) -> Result<bool, OrbError>;

    /// Half-closes the sending direction. Receiving keeps working.
    async fn close_send(&mut self) -> Result<(), OrbError>;

    /// Terminates both directions and releases transport resources.
    async fn close(&mut self) -> Result<(), OrbError>;
}

/// Caller side of a stream: sends `Req`, receives `Resp`.
pub struct ClientStream<Req, Resp> {
    ctx: Context,
    raw: Box<dyn RawStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> ClientStream<Req, Resp> {
    #[must_use]
    pub fn new(raw: Box<dyn RawStream>) -> Self {
        Self {
            ctx: raw.context().clone(),
            raw,
            _types: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// # Errors
    /// See [`RawStream::send`]; also 499/504 when the context ends first.
    pub async fn send(&mut self, req: Req) -> Result<(), OrbError> {
        self.ctx.run(self.raw.send(Box::new(req))).await
    }

    /// `None` once the server finished sending.
    ///
    /// # Errors
    /// See [`RawStream::recv`]; also 499/504 when the context ends first.
    pub async fn recv(&mut self) -> Result<Option<Resp>, OrbError> {
        let mut out = Resp::default();
        let more = self.ctx.run(self.raw.recv(&mut out)).await?;
        Ok(more.then_some(out))
    }

    /// # Errors
    /// Returns the transport's error.
    pub async fn close_send(&mut self) -> Result<(), OrbError> {
        self.raw.close_send().await
    }

    /// # Errors
    /// Returns the transport's error.
    pub async fn close(mut self) -> Result<(), OrbError> {
        self.raw.close().await
    }
}

impl<Req, Resp> fmt::Debug for ClientStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// Handler side of a stream: receives `Req`, sends `Resp`.
pub struct ServerStream<Req, Resp> {
    ctx: Context,
    raw: Box<dyn RawStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> ServerStream<Req, Resp> {
    #[must_use]
    pub fn new(raw: Box<dyn RawStream>) -> Self {
        Self {
            ctx: raw.context().clone(),
            raw,
            _types: PhantomData,
        }
    }

    /// The call context: incoming metadata from the caller, outgoing
    /// metadata sent along with the next message.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// `None` once the caller closed its sending side.
    ///
    /// # Errors
    /// Returns the transport's error, or 499/504 when the context ends.
    pub async fn recv(&mut self) -> Result<Option<Req>, OrbError> {
        let mut out = Req::default();
        let more = self.ctx.run(self.raw.recv(&mut out)).await?;
        Ok(more.then_some(out))
    }

    /// # Errors
    /// Returns the transport's error, or 499/504 when the context ends.
    pub async fn send(&mut self, resp: Resp) -> Result<(), OrbError> {
        self.ctx.run(self.raw.send(Box::new(resp))).await
    }
}

impl<Req, Resp> fmt::Debug for ServerStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}
