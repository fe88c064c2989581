//! Gzip bodies.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http::HeaderMap;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use orbkit_errors::OrbError;

use crate::MAX_BODY_SIZE;

pub const GZIP: &str = "gzip";

/// Whether `headers` list gzip in `Accept-Encoding`.
#[must_use]
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| {
            let mut parts = coding.split(';');
            let name = parts.next().unwrap_or_default().trim();
            let refused = parts.any(|p| matches!(p.trim(), "q=0" | "q=0.0" | "q=0.00" | "q=0.000"));
            name.eq_ignore_ascii_case(GZIP) && !refused
        })
}

/// Whether the body described by `headers` is gzip-encoded.
#[must_use]
pub fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(GZIP))
}

/// # Errors
/// Returns 500 when the encoder fails.
pub fn compress(body: &[u8]) -> Result<Bytes, OrbError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::fast());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Inflates `body`, refusing output larger than [`MAX_BODY_SIZE`].
///
/// # Errors
/// Returns 400 for a corrupt stream and 413 when the output is too large.
pub fn decompress(body: &[u8]) -> Result<Bytes, OrbError> {
    let limit = u64::try_from(MAX_BODY_SIZE).unwrap_or(u64::MAX);
    let mut out = Vec::new();
    GzDecoder::new(body)
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| OrbError::BAD_REQUEST.wrap(format!("gzip body: {e}")))?;
    if out.len() > MAX_BODY_SIZE {
        return Err(OrbError::http(413));
    }
    Ok(Bytes::from(out))
}
