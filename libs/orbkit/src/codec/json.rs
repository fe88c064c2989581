use bytes::Bytes;
use orbkit_errors::OrbError;

use super::{Codec, MIME_JSON};
use crate::message::DynMessage;

/// JSON through the message's serde implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_types(&self) -> &'static [&'static str] {
        &[MIME_JSON]
    }

    fn marshal(&self, msg: &dyn DynMessage) -> Result<Bytes, OrbError> {
        msg.encode_json()
    }

    fn unmarshal(&self, data: &[u8], msg: &mut dyn DynMessage) -> Result<(), OrbError> {
        msg.decode_json(data)
    }
}
