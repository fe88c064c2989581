//! The contract every client transport implements, and its link-time
//! registration.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use orbkit_errors::OrbError;

use super::options::{CallOptions, ClientConfig};
use crate::context::Context;
use crate::message::DynMessage;
use crate::stream::RawStream;

/// Where one call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub service: String,
    /// `/<service>/<Method>`.
    pub endpoint: String,
    pub transport: String,
    /// `host:port`, empty for the memory transport.
    pub address: String,
}

/// A response as the transport received it, before decoding.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub content_type: String,
    pub body: Bytes,
    /// The server's outgoing metadata.
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the client encodes requests and decodes responses, or the
    /// transport does it on its own.
    fn needs_codec(&self) -> bool;

    /// # Errors
    /// Fails when the transport cannot initialize.
    fn start(&self) -> Result<(), OrbError> {
        Ok(())
    }

    /// Releases pooled connections.
    async fn stop(&self) -> Result<(), OrbError> {
        Ok(())
    }

    /// Codec-mediated unary call: `body` is already encoded with
    /// `opts.content_type`.
    ///
    /// # Errors
    /// Any failure, already mapped onto the HTTP-coded taxonomy.
    async fn request(
        &self,
        _ctx: &Context,
        _info: &RequestInfo,
        _body: Bytes,
        _opts: &CallOptions,
    ) -> Result<RawResponse, OrbError> {
        Err(OrbError::UNIMPLEMENTED)
    }

    /// Unary call where the transport encodes `req` and decodes into
    /// `result` itself. Server metadata goes to `opts.response_metadata`.
    ///
    /// # Errors
    /// Any failure, already mapped onto the HTTP-coded taxonomy.
    async fn request_no_codec(
        &self,
        _ctx: &Context,
        _info: &RequestInfo,
        _req: &dyn DynMessage,
        _result: &mut dyn DynMessage,
        _opts: &CallOptions,
    ) -> Result<(), OrbError> {
        Err(OrbError::UNIMPLEMENTED)
    }

    /// Opens a bidirectional stream.
    ///
    /// # Errors
    /// [`OrbError::UNIMPLEMENTED`] when the wire protocol cannot stream.
    async fn stream(
        &self,
        _ctx: &Context,
        _info: &RequestInfo,
        _opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        Err(OrbError::UNIMPLEMENTED)
    }
}

/// Builds a transport instance for a client.
pub type TransportFactory = fn(&ClientConfig) -> Result<Arc<dyn Transport>, OrbError>;

/// Link-time registration of a client transport under `name`.
pub struct TransportRegistration {
    pub name: &'static str,
    pub factory: TransportFactory,
}

inventory::collect!(TransportRegistration);

/// Names of every transport linked into the process.
#[must_use]
pub fn known_transports() -> BTreeSet<&'static str> {
    inventory::iter::<TransportRegistration>
        .into_iter()
        .map(|r| r.name)
        .collect()
}

pub(crate) fn factory(name: &str) -> Option<TransportFactory> {
    inventory::iter::<TransportRegistration>
        .into_iter()
        .find(|r| r.name == name)
        .map(|r| r.factory)
}
