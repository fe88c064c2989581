//! gRPC transport for OrbKit.
//!
//! Registers the `grpc` and `grpcs` client transports and entrypoints.
//! Payloads are encoded with the OrbKit codec named by the call's content
//! type and travel through gRPC unchanged; metadata maps onto gRPC ASCII
//! metadata and errors onto gRPC status codes, with the exact HTTP code
//! carried alongside.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod client;
pub mod codec;
pub mod metadata;
pub mod server;

pub use client::{GrpcConnector, GrpcTransport};
pub use server::GrpcEntrypoint;

/// Plaintext transport name.
pub const NAME: &str = "grpc";
/// TLS transport name.
pub const NAME_TLS: &str = "grpcs";

/// Messages buffered per stream direction.
pub(crate) const STREAM_BUFFER: usize = 32;
