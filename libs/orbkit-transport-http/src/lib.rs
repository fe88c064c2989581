//! HTTP transports for OrbKit.
//!
//! Registers the `http`, `https`, `h2c` and `http3` client transports and
//! the matching entrypoints. A call is a `POST /<service>/<Method>` whose
//! body is the request encoded in the call's content type; metadata rides
//! in headers prefixed with `__orb-` both ways and errors come back as the
//! HTTP status of the response. HTTP has no streaming.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod client;
pub mod encoding;
pub mod handler;
pub mod headers;
pub mod http3;
pub mod server;
pub mod tls;

pub use client::HttpTransport;
pub use http3::Http3Transport;
pub use server::HttpEntrypoint;

/// HTTP/1.1 over TCP.
pub const NAME_HTTP: &str = "http";
/// HTTP/1.1 and HTTP/2 over TLS.
pub const NAME_HTTPS: &str = "https";
/// HTTP/2 with prior knowledge, no TLS.
pub const NAME_H2C: &str = "h2c";
/// HTTP/3 over QUIC.
pub const NAME_HTTP3: &str = "http3";

/// Largest request or response body accepted, after decompression.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;
