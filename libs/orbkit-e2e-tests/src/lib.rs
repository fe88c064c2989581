//! Shared fixtures for the end-to-end scenarios: the generated `echo` and
//! `file` services, their handlers, and a server harness.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod handlers;
pub mod harness;

use orbkit_transport_drpc as _;
use orbkit_transport_grpc as _;
use orbkit_transport_http as _;

/// Code generated from the test protos by `orbkit-codegen`.
#[allow(clippy::all, clippy::pedantic, missing_docs)]
pub mod proto {
    pub mod echo {
        include!(concat!(env!("OUT_DIR"), "/echo.rs"));
    }

    pub mod file {
        include!(concat!(env!("OUT_DIR"), "/file.rs"));
    }
}

pub use handlers::{EchoHandler, FileHandler};
pub use harness::Harness;
