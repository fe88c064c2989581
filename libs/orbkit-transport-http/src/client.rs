//! `http`, `https` and `h2c` client transports.
//!
//! All three share one hyper client per transport, whose keep-alive pool
//! takes the place of the OrbKit connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt as _, Full, Limited};
use hyper_rustls::{FixedServerNameResolver, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use orbkit::client::{CallOptions, ClientConfig, RawResponse, RequestInfo, Transport, TransportRegistration};
use orbkit::context::Context;
use orbkit::stream::RawStream;
use orbkit::tls::TlsConfig;
use orbkit_errors::OrbError;

use crate::encoding::{self, GZIP};
use crate::{MAX_BODY_SIZE, NAME_H2C, NAME_HTTP, NAME_HTTPS, headers, tls};

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// `POST <scheme>://<address><endpoint>` with the call's content type and
/// the caller's outgoing metadata.
pub(crate) fn request(
    ctx: &Context,
    scheme: &str,
    info: &RequestInfo,
    content_type: &str,
) -> http::request::Builder {
    let mut builder = http::Request::post(format!("{scheme}://{}{}", info.address, info.endpoint))
        .header(CONTENT_TYPE, content_type)
        .header(ACCEPT, content_type)
        .header(ACCEPT_ENCODING, GZIP);
    if let Some(map) = builder.headers_mut() {
        headers::write(map, &ctx.outgoing().snapshot());
    }
    builder
}

/// Turns a received response into a [`RawResponse`], or into the error its
/// status stands for. The error message is the response text when there is
/// one.
pub(crate) fn response(
    status: StatusCode,
    map: &HeaderMap,
    body: Bytes,
    content_type: &str,
) -> Result<RawResponse, OrbError> {
    let body = if encoding::is_gzip(map) {
        encoding::decompress(&body)?
    } else {
        body
    };
    if status != StatusCode::OK {
        let text = String::from_utf8_lossy(&body).trim().to_owned();
        return Err(if text.is_empty() {
            OrbError::http(status.as_u16())
        } else {
            OrbError::new(status.as_u16(), text)
        });
    }
    Ok(RawResponse {
        content_type: headers::content_type(map).unwrap_or_else(|| content_type.to_owned()),
        body,
        metadata: headers::read_prefixed(map),
    })
}

fn connector(config: &ClientConfig, secure: bool) -> Result<HttpsConnector<HttpConnector>, OrbError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    if !config.dial_timeout.is_zero() {
        http.set_connect_timeout(Some(config.dial_timeout));
    }

    let tls_config = if secure {
        config.tls.clone().unwrap_or_default()
    } else {
        TlsConfig::default()
    };
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls::client_config(&tls_config, &[])?)
        .https_or_http();
    let builder = if tls_config.server_name.is_some() {
        let name = tls::server_name(Some(&tls_config), "")?;
        builder.with_server_name_resolver(FixedServerNameResolver::new(name))
    } else {
        builder
    };
    Ok(builder.enable_http1().enable_http2().wrap_connector(http))
}

/// HTTP/1.1, HTTPS or H2C client transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    name: &'static str,
    scheme: &'static str,
    client: HyperClient,
}

impl HttpTransport {
    /// A transport for `name`, one of `http`, `https` or `h2c`.
    ///
    /// # Errors
    /// Returns 400 for another name or unusable TLS material.
    pub fn new(config: &ClientConfig, name: &'static str) -> Result<Self, OrbError> {
        let (scheme, h2_only) = match name {
            NAME_HTTP => ("http", false),
            NAME_HTTPS => ("https", false),
            NAME_H2C => ("http", true),
            other => return Err(OrbError::BAD_REQUEST.wrap(format!("{other} is not an http transport"))),
        };
        let mut builder = Client::builder(TokioExecutor::new());
        builder.http2_only(h2_only).pool_max_idle_per_host(config.pool.size);
        if !config.pool.ttl.is_zero() {
            builder.pool_idle_timeout(config.pool.ttl);
        }
        Ok(Self {
            name,
            scheme,
            client: builder.build(connector(config, name == NAME_HTTPS)?),
        })
    }

    async fn round_trip(&self, req: http::Request<Full<Bytes>>, content_type: &str) -> Result<RawResponse, OrbError> {
        let resp = self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                OrbError::UNAVAILABLE.wrap(e)
            } else {
                OrbError::INTERNAL_SERVER_ERROR.wrap(e)
            }
        })?;
        let (parts, body) = resp.into_parts();
        let body = Limited::new(body, MAX_BODY_SIZE)
            .collect()
            .await
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))?
            .to_bytes();
        response(parts.status, &parts.headers, body, content_type)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn needs_codec(&self) -> bool {
        true
    }

    async fn request(
        &self,
        ctx: &Context,
        info: &RequestInfo,
        body: Bytes,
        opts: &CallOptions,
    ) -> Result<RawResponse, OrbError> {
        let req = request(ctx, self.scheme, info, &opts.content_type)
            .body(Full::new(body))
            .map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        tracing::trace!(transport = self.name, endpoint = %info.endpoint, address = %info.address, "http request");
        ctx.run(self.round_trip(req, &opts.content_type)).await
    }

    async fn stream(
        &self,
        _ctx: &Context,
        _info: &RequestInfo,
        _opts: &CallOptions,
    ) -> Result<Box<dyn RawStream>, OrbError> {
        Err(OrbError::UNIMPLEMENTED.wrap(format!("{} has no streaming", self.name)))
    }
}

fn http(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(HttpTransport::new(config, NAME_HTTP)?))
}

fn https(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(HttpTransport::new(config, NAME_HTTPS)?))
}

fn h2c(config: &ClientConfig) -> Result<Arc<dyn Transport>, OrbError> {
    Ok(Arc::new(HttpTransport::new(config, NAME_H2C)?))
}

inventory::submit! {
    TransportRegistration { name: NAME_HTTP, factory: http }
}

inventory::submit! {
    TransportRegistration { name: NAME_HTTPS, factory: https }
}

inventory::submit! {
    TransportRegistration { name: NAME_H2C, factory: h2c }
}
