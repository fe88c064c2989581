//! DRPC transport for OrbKit.
//!
//! Registers the `drpc` client transport and entrypoint. Calls use the DRPC
//! packet framing over TCP: invoke metadata, the invoke itself, then message
//! frames in both directions. Every reply message is a [`Envelope`] carrying
//! the payload together with the handler's outgoing metadata, so metadata
//! set on the server reaches the caller with the next message, unary or
//! streaming.
//!
//! A connection carries one stream at a time; concurrency comes from the
//! connection pool.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod client;
pub mod conn;
pub mod envelope;
pub mod server;
pub mod wire;

pub use client::{DrpcConnector, DrpcTransport};
pub use conn::DrpcConn;
pub use envelope::{Envelope, InvokeMetadata};
pub use server::DrpcEntrypoint;
pub use wire::{Frame, FrameCodec, Kind, WireError};

/// Transport name.
pub const NAME: &str = "drpc";

/// Messages buffered per stream direction.
pub(crate) const STREAM_BUFFER: usize = 32;
