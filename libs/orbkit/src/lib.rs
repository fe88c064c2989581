//! OrbKit: a transport-agnostic RPC runtime.
//!
//! Services register handlers on one or more server [`server::Entrypoint`]s,
//! advertise them in a [`registry::Registry`], and are called through a
//! [`Client`] that resolves nodes, picks a transport and applies
//! middleware, deadlines and retries. The `memory` transport lives here;
//! wire transports (`grpc`, `drpc`, `http` and friends) live in their own
//! crates and plug in through `inventory` registrations, so linking a
//! transport crate is enough to make it available.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod memory;
pub mod message;
pub mod metadata;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod tls;

pub use client::{CallOptions, Client, ClientConfig};
pub use config::{OrbConfig, RegistryConfig};
pub use context::Context;
pub use message::{DynMessage, Message};
pub use metadata::Metadata;
pub use orbkit_errors::{OrbError, Result};
pub use registry::{Node, Registry, Service};
pub use server::{EntrypointConfig, RegistrationFn, Server, ServerConfig, ServerMux};
pub use stream::{ClientStream, RawStream, ServerStream};
pub use telemetry::{LoggingConfig, init_logging};

