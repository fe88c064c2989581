//! HTTP-coded error taxonomy shared by every OrbKit transport.
//!
//! Transport-native failures (gRPC status codes, DRPC numeric codes, HTTP
//! statuses) are normalized into a single [`OrbError`] carrying an
//! HTTP-style numeric code, a human message and an optional cause.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod error;
pub mod grpc;

pub use error::{OrbError, Result};
