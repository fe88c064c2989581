//! OrbKit metadata and content types on HTTP headers.

use std::collections::HashMap;

use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};
use orbkit::codec;
use orbkit::metadata::{HTTP_HEADER_PREFIX, is_reserved_header};

/// Writes `entries` as `__orb-<key>` headers. Entries that are not valid
/// header names or values are skipped.
pub fn write(headers: &mut HeaderMap, entries: &HashMap<String, String>) {
    for (key, value) in entries {
        if is_reserved_header(key) {
            continue;
        }
        let name = format!("{HTTP_HEADER_PREFIX}{}", key.to_ascii_lowercase());
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value.as_str())) else {
            tracing::debug!(%key, "metadata entry not representable as a header, skipped");
            continue;
        };
        headers.insert(name, value);
    }
}

/// The `__orb-` headers of a response, prefix stripped.
#[must_use]
pub fn read_prefixed(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(HTTP_HEADER_PREFIX)?;
            Some((key.to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}

/// Incoming metadata of a request: every `__orb-` header with the prefix
/// stripped, plus the plain headers that are not transport-level. A
/// prefixed header wins over a plain one of the same key.
#[must_use]
pub fn read_incoming(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = headers
        .iter()
        .filter(|(name, _)| {
            !name.as_str().starts_with(HTTP_HEADER_PREFIX) && !is_reserved_header(name.as_str())
        })
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect();
    out.extend(read_prefixed(headers));
    out
}

/// Normalized `Content-Type` of `headers`, if present.
#[must_use]
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(codec::normalize)
        .filter(|ct| !ct.is_empty())
}

/// The content type to answer with: the first `Accept` entry that is
/// served by a codec and allowed by `allowed`, else `request_type`.
#[must_use]
pub fn negotiate_accept(headers: &HeaderMap, request_type: &str, allowed: impl Fn(&str) -> bool) -> String {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(codec::normalize)
        .find(|ct| codec::codec_for(ct).is_ok() && allowed(ct))
        .unwrap_or_else(|| request_type.to_owned())
}
