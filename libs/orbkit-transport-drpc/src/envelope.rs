//! The reply envelope and invoke metadata carried in DRPC frames.

use std::collections::HashMap;

use bytes::Bytes;
use orbkit::codec;
use orbkit::message::DynMessage;
use orbkit_errors::OrbError;
use prost::Message as _;
use prost_types::Any;

/// Every reply message on a DRPC stream.
///
/// `data.value` is the payload encoded with the call's content type and
/// `data.type_url` names that content type. `metadata` is the handler's
/// outgoing metadata at the time the message was sent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub data: Option<Any>,
    #[prost(map = "string, string", tag = "2")]
    pub metadata: HashMap<String, String>,
    #[prost(string, tag = "3")]
    pub error: String,
}

/// Payload of an invoke-metadata frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeMetadata {
    #[prost(map = "string, string", tag = "1")]
    pub data: HashMap<String, String>,
}

impl Envelope {
    /// Encodes `msg` with `content_type` and attaches `metadata`.
    ///
    /// # Errors
    /// Returns the codec's error.
    pub fn wrap(
        content_type: &str,
        msg: &dyn DynMessage,
        metadata: HashMap<String, String>,
    ) -> Result<Self, OrbError> {
        let value = codec::marshal(content_type, msg)?;
        Ok(Self {
            data: Some(Any {
                type_url: codec::normalize(content_type),
                value: value.to_vec(),
            }),
            metadata,
            error: String::new(),
        })
    }

    /// Reads an envelope from a message frame.
    ///
    /// # Errors
    /// Returns 500 when the frame is not an envelope.
    pub fn from_frame(data: &[u8]) -> Result<Self, OrbError> {
        Self::decode(data).map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }

    #[must_use]
    pub fn to_frame(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// The encoded payload, or the error the peer put in the envelope.
    ///
    /// # Errors
    /// Returns 500 carrying `error` when it is set.
    pub fn payload(&self) -> Result<&[u8], OrbError> {
        if !self.error.is_empty() {
            return Err(OrbError::new(OrbError::INTERNAL_SERVER_ERROR.code(), self.error.clone()));
        }
        Ok(self.data.as_ref().map_or(&[][..], |any| any.value.as_slice()))
    }

    /// Decodes the payload into `into` with `content_type`.
    ///
    /// # Errors
    /// Returns the envelope's error or the codec's error.
    pub fn decode_into(&self, content_type: &str, into: &mut dyn DynMessage) -> Result<(), OrbError> {
        codec::unmarshal(content_type, self.payload()?, into)
    }
}

impl InvokeMetadata {
    /// Reads invoke metadata, treating garbage as empty.
    #[must_use]
    pub fn from_frame(data: &[u8]) -> HashMap<String, String> {
        match Self::decode(data) {
            Ok(md) => md.data,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring undecodable invoke metadata");
                HashMap::new()
            }
        }
    }

    #[must_use]
    pub fn to_frame(data: HashMap<String, String>) -> Bytes {
        Bytes::from(Self { data }.encode_to_vec())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use orbkit::codec::{MIME_JSON, MIME_PROTO};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    struct Greeting {
        #[prost(string, tag = "1")]
        #[serde(default)]
        msg: String,
    }

    #[test]
    fn test_envelope_carries_payload_and_metadata() {
        let md = HashMap::from([("tracing-id".to_owned(), "t-1".to_owned())]);
        let env = Envelope::wrap(MIME_JSON, &Greeting { msg: "hi".into() }, md).unwrap();
        assert_eq!(env.data.as_ref().unwrap().type_url, MIME_JSON);

        let back = Envelope::from_frame(&env.to_frame()).unwrap();
        assert_eq!(back.metadata["tracing-id"], "t-1");
        assert_eq!(back.payload().unwrap(), br#"{"msg":"hi"}"#);

        let mut out = Greeting::default();
        back.decode_into(MIME_JSON, &mut out).unwrap();
        assert_eq!(out.msg, "hi");
    }

    #[test]
    fn test_error_field_wins_over_data() {
        let mut env = Envelope::wrap(MIME_PROTO, &Greeting::default(), HashMap::new()).unwrap();
        env.error = "backend exploded".into();
        let err = env.decode_into(MIME_PROTO, &mut Greeting::default()).unwrap_err();
        assert_eq!(err.code(), 500);
        assert_eq!(err.message(), "backend exploded");
    }

    #[test]
    fn test_empty_envelope_is_default_message() {
        let env = Envelope::from_frame(&[]).unwrap();
        let mut out = Greeting { msg: "stale".into() };
        env.decode_into(MIME_PROTO, &mut out).unwrap();
        assert_eq!(out, Greeting::default());
    }

    #[test]
    fn test_invoke_metadata_tolerates_garbage() {
        let frame = InvokeMetadata::to_frame(HashMap::from([("content-type".to_owned(), MIME_JSON.to_owned())]));
        assert_eq!(InvokeMetadata::from_frame(&frame)["content-type"], MIME_JSON);
        assert!(InvokeMetadata::from_frame(&[0xff, 0xff]).is_empty());
    }
}
