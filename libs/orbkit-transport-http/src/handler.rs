//! The axum router behind every HTTP entrypoint.
//!
//! One fallback route serves the whole handler table: the request path is
//! the endpoint, the body is decoded with the codec of its `Content-Type`
//! and the answer is encoded in the negotiated `Accept` type.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, VARY};
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt as _, LengthLimitError, Limited};
use orbkit::codec::{self, MIME_JSON};
use orbkit::context::Context;
use orbkit::metadata::{self as md, Metadata, split_endpoint};
use orbkit::server::{EntrypointConfig, HandlerTable, Method};
use orbkit_errors::OrbError;
use tracing::Instrument as _;

use crate::encoding::{self, GZIP};
use crate::{MAX_BODY_SIZE, headers};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Clone)]
struct HttpState {
    table: Arc<HandlerTable>,
    gzip: bool,
    whitelist: Arc<[String]>,
}

/// The router serving `table` with the codec and gzip settings of `config`.
pub fn router(table: Arc<HandlerTable>, config: &EntrypointConfig) -> Router {
    let state = HttpState {
        table,
        gzip: config.gzip,
        whitelist: expand_whitelist(&config.codec_whitelist),
    };
    Router::new().fallback(dispatch).with_state(state)
}

/// Entries naming a codec (`json`, `proto`) stand for every MIME type that
/// codec serves.
fn expand_whitelist(entries: &[String]) -> Arc<[String]> {
    entries
        .iter()
        .flat_map(|entry| match codec::codec_by_name(entry) {
            Some(c) => c.content_types().iter().map(|ct| (*ct).to_owned()).collect(),
            None => vec![codec::normalize(entry)],
        })
        .collect()
}

/// The plain-text error answer for `err`.
#[must_use]
pub fn error_response(err: &OrbError) -> Response {
    (err.status(), [(CONTENT_TYPE, TEXT_PLAIN)], err.to_string()).into_response()
}

async fn dispatch(State(state): State<HttpState>, req: Request) -> Response {
    let endpoint = req.uri().path().to_owned();
    let span = tracing::debug_span!("http_call", %endpoint, method = %req.method());
    match state.call(&endpoint, req).instrument(span).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::debug!(%endpoint, code = err.code(), error = %err, "http call failed");
            error_response(&err)
        }
    }
}

impl HttpState {
    fn allowed(&self, content_type: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|ct| ct == content_type)
    }

    async fn call(&self, endpoint: &str, req: Request) -> Result<Response, OrbError> {
        if req.method() != http::Method::POST {
            return Err(OrbError::http(StatusCode::METHOD_NOT_ALLOWED.as_u16()));
        }
        match self.table.method(endpoint) {
            Some(Method::Unary { .. }) => {}
            Some(Method::Stream(_)) => {
                return Err(OrbError::UNIMPLEMENTED.wrap(format!("{endpoint} is streaming, http has no streams")));
            }
            None => return Err(OrbError::NOT_FOUND.wrap(format!("unknown method {endpoint}"))),
        }

        let (parts, body) = req.into_parts();
        let content_type = headers::content_type(&parts.headers).unwrap_or_else(|| MIME_JSON.to_owned());
        if codec::codec_for(&content_type).is_err() || !self.allowed(&content_type) {
            return Err(OrbError::http(StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16())
                .wrap(format!("content type {content_type} not supported")));
        }
        let accept = headers::negotiate_accept(&parts.headers, &content_type, |ct| self.allowed(ct));

        let body = read_body(body).await?;
        let body = if encoding::is_gzip(&parts.headers) {
            encoding::decompress(&body)?
        } else {
            body
        };

        let incoming = Metadata::from_map(headers::read_incoming(&parts.headers));
        incoming.set(md::CONTENT_TYPE, content_type.as_str());
        let (service, method) = split_endpoint(endpoint);
        incoming.set(md::SERVICE, service);
        incoming.set(md::METHOD, method);
        let ctx = Context::background().with_incoming(incoming);

        let req = self.table.decode_request(endpoint, &content_type, &body)?;
        let resp = self.table.invoke_unary(&ctx, endpoint, req).await?;
        let mut out = codec::marshal(&accept, resp.as_ref())?;

        let mut builder = Response::builder().status(StatusCode::OK).header(CONTENT_TYPE, accept.as_str());
        if let Some(map) = builder.headers_mut() {
            headers::write(map, &ctx.outgoing().snapshot());
            if self.gzip && encoding::accepts_gzip(&parts.headers) {
                out = encoding::compress(&out)?;
                map.insert(CONTENT_ENCODING, HeaderValue::from_static(GZIP));
                map.insert(VARY, HeaderValue::from_static("accept-encoding"));
            }
        }
        builder
            .body(Body::from(out))
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }
}

async fn read_body(body: Body) -> Result<Bytes, OrbError> {
    Limited::new(body, MAX_BODY_SIZE)
        .collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                OrbError::http(StatusCode::PAYLOAD_TOO_LARGE.as_u16())
            } else {
                OrbError::BAD_REQUEST.wrap(e)
            }
        })
}
