//! OrbKit metadata on gRPC metadata maps.

use std::collections::HashMap;
use std::time::Duration;

use orbkit::codec::{MIME_JSON, MIME_PROTO};
use orbkit::metadata::is_reserved_header;
use orbkit_errors::grpc::ORB_CODE_KEY;
use tonic::metadata::{Ascii, AsciiMetadataValue, KeyAndValueRef, MetadataKey, MetadataMap};

/// Carries the payload content type; gRPC's own `content-type` header is
/// always `application/grpc`.
pub const CONTENT_TYPE_KEY: &str = "x-orb-content-type";

const GRPC_TIMEOUT: &str = "grpc-timeout";

fn is_transport_key(key: &str) -> bool {
    is_reserved_header(key) || key.starts_with("grpc-") || key == CONTENT_TYPE_KEY || key == ORB_CODE_KEY
}

/// Copies `entries` into `map`. Keys gRPC cannot carry as ASCII metadata are
/// skipped.
pub fn write(map: &mut MetadataMap, entries: &HashMap<String, String>) {
    for (key, value) in entries {
        if is_transport_key(key) {
            continue;
        }
        let (Ok(k), Ok(v)) = (
            MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
            AsciiMetadataValue::try_from(value.as_str()),
        ) else {
            tracing::debug!(%key, "metadata entry not representable in grpc, skipped");
            continue;
        };
        map.insert(k, v);
    }
}

/// The application entries of `map`.
#[must_use]
pub fn read(map: &MetadataMap) -> HashMap<String, String> {
    map.iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => {
                let key = key.as_str();
                if is_transport_key(key) {
                    return None;
                }
                value.to_str().ok().map(|v| (key.to_owned(), v.to_owned()))
            }
            KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

pub fn set_content_type(map: &mut MetadataMap, content_type: &str) {
    if let Ok(v) = AsciiMetadataValue::try_from(content_type) {
        map.insert(CONTENT_TYPE_KEY, v);
    }
}

/// Payload content type of a request: the explicit key, then the gRPC
/// content subtype, then protobuf.
#[must_use]
pub fn content_type(map: &MetadataMap) -> String {
    if let Some(ct) = map.get(CONTENT_TYPE_KEY).and_then(|v| v.to_str().ok()) {
        return orbkit::codec::normalize(ct);
    }
    let subtype = map
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.strip_prefix("application/grpc+"));
    match subtype {
        Some("json") => MIME_JSON.to_owned(),
        _ => MIME_PROTO.to_owned(),
    }
}

/// The caller's remaining budget from `grpc-timeout`, if sent.
#[must_use]
pub fn timeout(map: &MetadataMap) -> Option<Duration> {
    let raw = map.get(GRPC_TIMEOUT)?.to_str().ok()?;
    parse_timeout(raw)
}

fn parse_timeout(raw: &str) -> Option<Duration> {
    let unit = raw.chars().last()?;
    let value: u64 = raw[..raw.len() - unit.len_utf8()].parse().ok()?;
    Some(match unit {
        'H' => Duration::from_secs(value.saturating_mul(3600)),
        'M' => Duration::from_secs(value.saturating_mul(60)),
        'S' => Duration::from_secs(value),
        'm' => Duration::from_millis(value),
        'u' => Duration::from_micros(value),
        'n' => Duration::from_nanos(value),
        _ => return None,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_skips_transport_keys() {
        let mut map = MetadataMap::new();
        let entries = HashMap::from([
            ("tracing-id".to_owned(), "abc".to_owned()),
            ("content-type".to_owned(), "application/json".to_owned()),
            ("grpc-status".to_owned(), "0".to_owned()),
            ("bad key".to_owned(), "x".to_owned()),
        ]);
        write(&mut map, &entries);
        set_content_type(&mut map, MIME_JSON);

        let back = read(&map);
        assert_eq!(back.len(), 1);
        assert_eq!(back["tracing-id"], "abc");
        assert_eq!(content_type(&map), MIME_JSON);
    }

    #[test]
    fn test_content_type_from_grpc_subtype() {
        let mut map = MetadataMap::new();
        map.insert("content-type", AsciiMetadataValue::from_static("application/grpc+json"));
        assert_eq!(content_type(&map), MIME_JSON);
        assert_eq!(content_type(&MetadataMap::new()), MIME_PROTO);
    }

    #[test]
    fn test_parse_timeout_units() {
        assert_eq!(parse_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_timeout("5x"), None);
        assert_eq!(parse_timeout("m"), None);
    }
}
