//! Message values that can travel over any transport.
//!
//! A [`Message`] is anything that is both a protobuf message and a serde
//! value. [`DynMessage`] is its object-safe face, used wherever the concrete
//! type is erased (codecs, memory transport, server handlers).

use std::any::Any;
use std::fmt;

use bytes::Bytes;
use orbkit_errors::OrbError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Marker for types usable as RPC request or response values.
pub trait Message:
    prost::Message + Serialize + DeserializeOwned + Default + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> Message for T where
    T: prost::Message + Serialize + DeserializeOwned + Default + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Object-safe view of a [`Message`].
pub trait DynMessage: Send + Sync + fmt::Debug + 'static {
    fn encode_proto(&self) -> Bytes;

    /// Replaces `self` with the protobuf-decoded `buf`.
    ///
    /// # Errors
    /// Returns 400 when `buf` is not a valid encoding.
    fn decode_proto(&mut self, buf: &[u8]) -> Result<(), OrbError>;

    /// # Errors
    /// Returns 500 when the value cannot be serialized.
    fn encode_json(&self) -> Result<Bytes, OrbError>;

    /// Replaces `self` with the JSON-decoded `buf`.
    ///
    /// # Errors
    /// Returns 400 when `buf` is not valid JSON for this type.
    fn decode_json(&mut self, buf: &[u8]) -> Result<(), OrbError>;

    /// Moves `other` into `self`.
    ///
    /// A value of the same concrete type is moved directly; anything else is
    /// transcoded through its protobuf encoding.
    ///
    /// # Errors
    /// Returns 500 when transcoding fails.
    fn assign(&mut self, other: Box<dyn DynMessage>) -> Result<(), OrbError>;

    fn clone_message(&self) -> Box<dyn DynMessage>;

    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Message> DynMessage for T {
    fn encode_proto(&self) -> Bytes {
        Bytes::from(prost::Message::encode_to_vec(self))
    }

    fn decode_proto(&mut self, buf: &[u8]) -> Result<(), OrbError> {
        *self = <T as prost::Message>::decode(buf).map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        Ok(())
    }

    fn encode_json(&self) -> Result<Bytes, OrbError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }

    fn decode_json(&mut self, buf: &[u8]) -> Result<(), OrbError> {
        *self = serde_json::from_slice(buf).map_err(|e| OrbError::BAD_REQUEST.wrap(e))?;
        Ok(())
    }

    fn assign(&mut self, other: Box<dyn DynMessage>) -> Result<(), OrbError> {
        if other.as_any().is::<T>() {
            if let Ok(v) = other.into_any().downcast::<T>() {
                *self = *v;
            }
            return Ok(());
        }
        let bytes = other.encode_proto();
        self.decode_proto(&bytes)
            .map_err(|e| OrbError::INTERNAL_SERVER_ERROR.wrap(e))
    }

    fn clone_message(&self) -> Box<dyn DynMessage> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn DynMessage {
    /// Takes the concrete value out of a boxed message.
    ///
    /// # Errors
    /// Returns 500 when the box holds a different type and cannot be
    /// transcoded into `T`.
    pub fn downcast<T: Message>(self: Box<Self>) -> Result<T, OrbError> {
        let mut out = T::default();
        out.assign(self)?;
        Ok(out)
    }

    #[must_use]
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Factory for empty request values, used by type-erased handlers.
pub type MessageFactory = fn() -> Box<dyn DynMessage>;

/// Returns a [`MessageFactory`] for `T`.
#[must_use]
pub fn factory<T: Message>() -> MessageFactory {
    || Box::new(T::default())
}


#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::testing::{Ping, PingMirror};
    use super::*;

    #[test]
    fn test_assign_same_type_moves() {
        let mut dst = Ping::default();
        dst.assign(Box::new(Ping { name: "a".into() })).unwrap();
        assert_eq!(dst.name, "a");
    }

    #[test]
    fn test_assign_transcodes_mirror_type() {
        let mut dst = PingMirror::default();
        dst.assign(Box::new(Ping { name: "b".into() })).unwrap();
        assert_eq!(dst.name, "b");
    }

    #[test]
    fn test_json_and_proto_decode() {
        let mut p = Ping::default();
        p.decode_json(br#"{"name":"Alex"}"#).unwrap();
        assert_eq!(p.name, "Alex");

        let encoded = p.encode_proto();
        let mut q = Ping::default();
        q.decode_proto(&encoded).unwrap();
        assert_eq!(q, p);
    }

    #[test]
    fn test_decode_error_is_bad_request() {
        let mut p = Ping::default();
        let err = p.decode_json(b"not json").unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_boxed_downcast() {
        let boxed: Box<dyn DynMessage> = Box::new(Ping { name: "c".into() });
        assert!(boxed.downcast_ref::<Ping>().is_some());
        let p: Ping = boxed.downcast().unwrap();
        assert_eq!(p.name, "c");
    }
}
