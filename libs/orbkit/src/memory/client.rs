use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use orbkit_errors::OrbError;
use tracing::Instrument;

use super::stream::{ServerEnd, pair};
use super::{NAME, lookup};
use crate::client::{CallOptions, ClientConfig, RawResponse, RequestInfo, Transport, TransportRegistration};
use crate::codec;
use crate::context::Context;
use crate::message::DynMessage;
use crate::metadata::{self, split_endpoint};
use crate::stream::RawStream;

/// Client side of the `memory` transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryTransport;

/// The handler's context: same deadline, cancelled with the caller, fresh
/// metadata with the caller's outgoing map as incoming.
fn server_context(ctx: &Context, info: &RequestInfo, content_type: &str) -> Context {
    let server_ctx = ctx.child().with_new_metadata();
    let incoming = server_ctx.incoming();
    incoming.extend(ctx.outgoing().snapshot());
    incoming.set(metadata::CONTENT_TYPE, content_type);
    let (service, method) = split_endpoint(&info.endpoint);
    incoming.set(metadata::SERVICE, service);
    incoming.set(metadata::METHOD, method);
    server_ctx
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn needs_codec(&self) -> bool {
        false
    }

    async fn request(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        body: Bytes,
        opts: &CallOptions,
    ) -> Result<RawResponse, OrbError> {
        let table = lookup(&info.service)?;
        let req = table.decode_request(&info.endpoint, &opts.content_type, &body)?;
        let server_ctx = server_context(ctx, info, &opts.content_type);
        let resp = table.invoke_unary(&server_ctx, &info.endpoint, req).await?;
        Ok(RawResponse {
            content_type: opts.content_type.clone(),
            body: codec::marshal(&opts.content_type, resp.as_ref())?,
            metadata: server_ctx.outgoing().snapshot(),
        })
    }

    async fn request_no_codec(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        req: &dyn DynMessage,
        result: &mut dyn DynMessage,
        opts: &CallOptions,
    ) -> Result<(), OrbError> {
        let table = lookup(&info.service)?;
        let server_ctx = server_context(ctx, info, &opts.content_type);
        let resp = table.invoke_unary(&server_ctx, &info.endpoint, req.clone_message()).await?;
        result.assign(resp)?;
        if let Some(md) = &opts.response_metadata {
            md.extend(server_ctx.outgoing().snapshot());
        }
        Ok(())
    }

    async fn stream(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        let table = lookup(&info.service)?;
        let server_ctx = server_context(ctx, info, &opts.content_type);
        let (client, server) = pair(ctx.clone(), server_ctx, opts.response_metadata.clone());
        let ServerEnd { stream, errors, keep_open } = server;

        let endpoint = info.endpoint.clone();
        let span = tracing::debug_span!("memory_stream", service = %info.service, %endpoint);
        tokio::spawn(
            async move {
                if let Err(err) = table.invoke_stream(&endpoint, Box::new(stream)).await {
                    tracing::debug!(code = err.code(), error = %err, "stream handler failed");
                    if errors.send(err).await.is_err() {
                        tracing::trace!("stream client gone before the handler error");
                    }
                }
                drop(keep_open);
            }
            .instrument(span),
        );
        Ok(Box::new(client))
    }
}

#[allow(clippy::unnecessary_wraps)]
fn factory(_cfg: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(MemoryTransport))
}

inventory::submit! {
    TransportRegistration { name: NAME, factory }
}
