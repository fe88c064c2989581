//! gRPC status code mapping.
//!
//! Codes are plain `i32` values as defined by the gRPC protocol so the table
//! is usable without pulling in a gRPC runtime. The `tonic` feature adds
//! `Status` conversions on top.

use crate::OrbError;

pub const OK: i32 = 0;
pub const CANCELLED: i32 = 1;
pub const UNKNOWN: i32 = 2;
pub const INVALID_ARGUMENT: i32 = 3;
pub const DEADLINE_EXCEEDED: i32 = 4;
pub const NOT_FOUND: i32 = 5;
pub const ALREADY_EXISTS: i32 = 6;
pub const PERMISSION_DENIED: i32 = 7;
pub const RESOURCE_EXHAUSTED: i32 = 8;
pub const FAILED_PRECONDITION: i32 = 9;
pub const ABORTED: i32 = 10;
pub const OUT_OF_RANGE: i32 = 11;
pub const UNIMPLEMENTED: i32 = 12;
pub const INTERNAL: i32 = 13;
pub const UNAVAILABLE: i32 = 14;
pub const DATA_LOSS: i32 = 15;
pub const UNAUTHENTICATED: i32 = 16;

/// Metadata key carrying the exact HTTP code next to a gRPC status, so codes
/// that share a gRPC bucket (408 and 504) survive the round trip.
pub const ORB_CODE_KEY: &str = "x-orb-code";

/// Maps a gRPC status code to its HTTP equivalent.
#[must_use]
pub fn http_code(grpc: i32) -> u16 {
    match grpc {
        OK => 200,
        CANCELLED => 499,
        INVALID_ARGUMENT | FAILED_PRECONDITION | OUT_OF_RANGE => 400,
        NOT_FOUND => 404,
        ALREADY_EXISTS | ABORTED => 409,
        PERMISSION_DENIED => 403,
        UNAUTHENTICATED => 401,
        RESOURCE_EXHAUSTED => 429,
        UNIMPLEMENTED => 501,
        UNAVAILABLE => 503,
        DEADLINE_EXCEEDED => 504,
        _ => 500,
    }
}

/// Maps an HTTP code onto the closest gRPC status code.
#[must_use]
pub fn grpc_code(http: u16) -> i32 {
    match http {
        200..=299 => OK,
        400 => INVALID_ARGUMENT,
        401 => UNAUTHENTICATED,
        403 => PERMISSION_DENIED,
        404 => NOT_FOUND,
        408 | 504 => DEADLINE_EXCEEDED,
        409 => ALREADY_EXISTS,
        429 => RESOURCE_EXHAUSTED,
        499 => CANCELLED,
        501 => UNIMPLEMENTED,
        503 => UNAVAILABLE,
        500..=599 => INTERNAL,
        _ => UNKNOWN,
    }
}

impl OrbError {
    /// Builds the taxonomy error for a gRPC status code and message.
    #[must_use]
    pub fn from_grpc(code: i32, message: &str) -> Self {
        let http = http_code(code);
        if message.is_empty() {
            Self::http(http)
        } else {
            Self::new(http, message.to_owned())
        }
    }

    /// The gRPC status code this error travels as.
    #[must_use]
    pub fn grpc_code(&self) -> i32 {
        grpc_code(self.code())
    }
}

#[cfg(feature = "tonic")]
mod tonic_impl {
    use super::ORB_CODE_KEY;
    use crate::OrbError;
    use tonic::metadata::{AsciiMetadataValue, MetadataMap};
    use tonic::{Code, Status};

    impl From<Status> for OrbError {
        fn from(status: Status) -> Self {
            let exact = status
                .metadata()
                .get(ORB_CODE_KEY)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u16>().ok());
            match exact {
                Some(code) if status.message().is_empty() => OrbError::http(code),
                Some(code) => OrbError::new(code, status.message().to_owned()),
                None => OrbError::from_grpc(status.code() as i32, status.message()),
            }
        }
    }

    impl From<OrbError> for Status {
        fn from(err: OrbError) -> Self {
            let mut md = MetadataMap::new();
            if let Ok(v) = AsciiMetadataValue::try_from(err.code().to_string()) {
                md.insert(ORB_CODE_KEY, v);
            }
            Status::with_metadata(Code::from_i32(err.grpc_code()), err.to_string(), md)
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_to_http_table() {
        let table = [
            (OK, 200),
            (CANCELLED, 499),
            (INVALID_ARGUMENT, 400),
            (NOT_FOUND, 404),
            (ALREADY_EXISTS, 409),
            (PERMISSION_DENIED, 403),
            (UNAUTHENTICATED, 401),
            (RESOURCE_EXHAUSTED, 429),
            (FAILED_PRECONDITION, 400),
            (OUT_OF_RANGE, 400),
            (UNIMPLEMENTED, 501),
            (UNAVAILABLE, 503),
            (ABORTED, 409),
            (DEADLINE_EXCEEDED, 504),
            (INTERNAL, 500),
            (UNKNOWN, 500),
            (DATA_LOSS, 500),
        ];
        for (grpc, http) in table {
            assert_eq!(http_code(grpc), http, "grpc code {grpc}");
        }
    }

    #[test]
    fn test_http_to_grpc_round_trip_for_canonical_kinds() {
        for code in [400, 401, 403, 404, 409, 429, 499, 501, 503, 504] {
            assert_eq!(http_code(grpc_code(code)), code, "http code {code}");
        }
        assert_eq!(grpc_code(500), INTERNAL);
    }

    #[test]
    fn test_from_grpc_message() {
        let err = OrbError::from_grpc(UNAUTHENTICATED, "");
        assert_eq!(err.to_string(), "unauthorized");
        let err = OrbError::from_grpc(NOT_FOUND, "no such thing");
        assert_eq!(err.code(), 404);
        assert_eq!(err.to_string(), "no such thing");
    }

    #[cfg(feature = "tonic")]
    #[test]
    fn test_status_round_trip_keeps_exact_code() {
        let status: tonic::Status = OrbError::REQUEST_TIMEOUT.into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
        let back = OrbError::from(status);
        assert_eq!(back.code(), 408);
    }
}
