use bytes::Bytes;
use orbkit_errors::OrbError;

use super::{Codec, MIME_OCTET_STREAM, MIME_PROTO, MIME_PROTOBUF, MIME_X_PROTOBUF};
use crate::message::DynMessage;

/// Protobuf binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &'static str {
        "proto"
    }

    fn content_types(&self) -> &'static [&'static str] {
        &[MIME_PROTO, MIME_X_PROTOBUF, MIME_PROTOBUF, MIME_OCTET_STREAM]
    }

    fn marshal(&self, msg: &dyn DynMessage) -> Result<Bytes, OrbError> {
        Ok(msg.encode_proto())
    }

    fn unmarshal(&self, data: &[u8], msg: &mut dyn DynMessage) -> Result<(), OrbError> {
        msg.decode_proto(data)
    }
}
