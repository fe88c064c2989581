//! Process-wide codec registry.
//!
//! Codecs are collected once, at first use, from every
//! [`CodecRegistration`] submitted through `inventory`. Lookups are keyed
//! by MIME type (several aliases may point at the same codec) or by codec
//! name. The registry is read-only after it is built.

mod json;
mod proto;

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use orbkit_errors::OrbError;

use crate::message::DynMessage;

pub use json::JsonCodec;
pub use proto::ProtoCodec;

pub const MIME_JSON: &str = "application/json";
pub const MIME_PROTO: &str = "application/proto";
pub const MIME_X_PROTOBUF: &str = "application/x-protobuf";
pub const MIME_PROTOBUF: &str = "application/protobuf";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Encodes and decodes [`DynMessage`] values for a set of content types.
pub trait Codec: Send + Sync + 'static {
    /// Short name, e.g. `json` or `proto`.
    fn name(&self) -> &'static str;

    /// MIME types served by this codec. The first entry is canonical.
    fn content_types(&self) -> &'static [&'static str];

    /// # Errors
    /// Returns 500 when `msg` cannot be encoded.
    fn marshal(&self, msg: &dyn DynMessage) -> Result<Bytes, OrbError>;

    /// # Errors
    /// Returns 400 when `data` is not a valid encoding for `msg`.
    fn unmarshal(&self, data: &[u8], msg: &mut dyn DynMessage) -> Result<(), OrbError>;
}

/// Link-time codec registration.
pub struct CodecRegistration {
    pub codec: &'static dyn Codec,
}

inventory::collect!(CodecRegistration);

inventory::submit! {
    CodecRegistration { codec: &JsonCodec }
}

inventory::submit! {
    CodecRegistration { codec: &ProtoCodec }
}

struct Codecs {
    by_mime: HashMap<&'static str, &'static dyn Codec>,
    by_name: HashMap<&'static str, &'static dyn Codec>,
}

fn codecs() -> &'static Codecs {
    static CODECS: OnceLock<Codecs> = OnceLock::new();
    CODECS.get_or_init(|| {
        let mut by_mime = HashMap::new();
        let mut by_name = HashMap::new();
        for reg in inventory::iter::<CodecRegistration> {
            if by_name.insert(reg.codec.name(), reg.codec).is_some() {
                tracing::warn!(codec = reg.codec.name(), "duplicate codec registration");
            }
            for mime in reg.codec.content_types() {
                by_mime.insert(*mime, reg.codec);
            }
        }
        tracing::debug!(codecs = by_name.len(), mime_types = by_mime.len(), "codec registry built");
        Codecs { by_mime, by_name }
    })
}

/// Strips parameters and lower-cases a `Content-Type` value.
#[must_use]
pub fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Looks up the codec serving `content_type`.
///
/// # Errors
/// Returns 400 when no codec serves the content type.
pub fn codec_for(content_type: &str) -> Result<&'static dyn Codec, OrbError> {
    let ct = normalize(content_type);
    codecs().by_mime.get(ct.as_str()).copied().ok_or_else(|| {
        OrbError::BAD_REQUEST.wrap(format!("no codec for content type '{content_type}'"))
    })
}

/// Looks up a codec by its short name.
#[must_use]
pub fn codec_by_name(name: &str) -> Option<&'static dyn Codec> {
    codecs().by_name.get(name).copied()
}

/// Every registered MIME type.
#[must_use]
pub fn content_types() -> Vec<&'static str> {
    let mut out: Vec<_> = codecs().by_mime.keys().copied().collect();
    out.sort_unstable();
    out
}

/// Encodes `msg` with the codec serving `content_type`.
///
/// # Errors
/// Propagates lookup and encoding failures.
pub fn marshal(content_type: &str, msg: &dyn DynMessage) -> Result<Bytes, OrbError> {
    codec_for(content_type)?.marshal(msg)
}

/// Decodes `data` into `msg` with the codec serving `content_type`.
///
/// # Errors
/// Propagates lookup and decoding failures.
pub fn unmarshal(content_type: &str, data: &[u8], msg: &mut dyn DynMessage) -> Result<(), OrbError> {
    codec_for(content_type)?.unmarshal(data, msg)
}

/// Whether `content_type` resolves to the protobuf codec.
#[must_use]
pub fn is_proto(content_type: &str) -> bool {
    codec_for(content_type).is_ok_and(|c| c.name() == ProtoCodec.name())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::message::testing::Ping;

    #[test]
    fn test_aliases_share_codec() {
        for mime in [MIME_PROTO, MIME_X_PROTOBUF, MIME_PROTOBUF] {
            assert_eq!(codec_for(mime).unwrap().name(), "proto");
        }
        assert_eq!(codec_for(MIME_JSON).unwrap().name(), "json");
    }

    #[test]
    fn test_content_type_parameters_are_ignored() {
        let codec = codec_for("Application/JSON; charset=utf-8").unwrap();
        assert_eq!(codec.name(), "json");
    }

    #[test]
    fn test_unknown_content_type() {
        let err = codec_for("text/x-nope").err().unwrap();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_marshal_through_registry() {
        let ping = Ping { name: "Alex".into() };
        let bytes = marshal(MIME_JSON, &ping).unwrap();
        assert_eq!(&bytes[..], br#"{"name":"Alex"}"#);

        let mut out = Ping::default();
        unmarshal(MIME_JSON, &bytes, &mut out).unwrap();
        assert_eq!(out, ping);
        assert!(is_proto(MIME_PROTO));
        assert!(!is_proto(MIME_JSON));
    }
}
