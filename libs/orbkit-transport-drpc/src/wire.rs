//! DRPC packet framing.
//!
//! A frame is one header byte followed by three varints and the payload:
//!
//! ```text
//! +---------+--------+------+-----------+------------+--------+------+
//! | control | kind:6 | done | stream id | message id | length | data |
//! +---------+--------+------+-----------+------------+--------+------+
//! ```
//!
//! Frames are never split across packets, so `done` is always set on write.
//! Frames with the control bit set are reserved and skipped on read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use orbkit_errors::OrbError;
use prost::encoding::{encode_varint, encoded_len_varint};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload accepted in one frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const DONE_BIT: u8 = 0b0000_0001;
const CONTROL_BIT: u8 = 0b1000_0000;
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Payload is the rpc name, `/<service>/<Method>`.
    Invoke = 1,
    Message = 2,
    /// Payload is an 8-byte big-endian code followed by the message.
    Error = 3,
    Cancel = 4,
    Close = 5,
    CloseSend = 6,
    /// Payload is a protobuf [`crate::InvokeMetadata`].
    InvokeMetadata = 7,
}

impl TryFrom<u8> for Kind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Self::Invoke,
            2 => Self::Message,
            3 => Self::Error,
            4 => Self::Cancel,
            5 => Self::Close,
            6 => Self::CloseSend,
            7 => Self::InvokeMetadata,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: u64,
    pub message: u64,
    pub kind: Kind,
    pub data: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(stream: u64, message: u64, kind: Kind, data: impl Into<Bytes>) -> Self {
        Self {
            stream,
            message,
            kind,
            data: data.into(),
        }
    }

    fn header(&self) -> u8 {
        ((self.kind as u8) << 1) | DONE_BIT
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the limit of {max} bytes", max = MAX_FRAME_SIZE)]
    TooLarge(u64),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("malformed varint")]
    Varint,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WireError> for OrbError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(_) => OrbError::UNAVAILABLE.wrap(err),
            _ => OrbError::INTERNAL_SERVER_ERROR.wrap(err),
        }
    }
}

/// Reads a varint from the front of `buf` without consuming it.
///
/// `Ok(None)` when `buf` ends in the middle of the varint.
fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(WireError::Varint)
    } else {
        Ok(None)
    }
}

/// [`tokio_util::codec`] framing for DRPC packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let len = frame.data.len() as u64;
        if frame.data.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(len));
        }
        dst.reserve(
            1 + encoded_len_varint(frame.stream)
                + encoded_len_varint(frame.message)
                + encoded_len_varint(len)
                + frame.data.len(),
        );
        dst.put_u8(frame.header());
        encode_varint(frame.stream, dst);
        encode_varint(frame.message, dst);
        encode_varint(len, dst);
        dst.put(frame.data);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            let Some(&header) = src.first() else {
                return Ok(None);
            };
            let mut offset = 1;
            let mut fields = [0u64; 3];
            for field in &mut fields {
                let Some((value, used)) = peek_varint(&src[offset..])? else {
                    return Ok(None);
                };
                *field = value;
                offset += used;
            }
            let [stream, message, len] = fields;
            let size = usize::try_from(len)
                .ok()
                .filter(|&n| n <= MAX_FRAME_SIZE)
                .ok_or(WireError::TooLarge(len))?;
            if src.len() < offset + size {
                src.reserve(offset + size - src.len());
                return Ok(None);
            }

            src.advance(offset);
            let data = src.split_to(size).freeze();
            if header & CONTROL_BIT != 0 {
                tracing::trace!(header, "skipping control frame");
                continue;
            }
            let kind = Kind::try_from((header >> 1) & 0x3f)?;
            return Ok(Some(Frame {
                stream,
                message,
                kind,
                data,
            }));
        }
    }
}

/// Payload of an [`Kind::Error`] frame for `err`.
#[must_use]
pub fn encode_error(err: &OrbError) -> Bytes {
    let text = err.to_string();
    let mut buf = BytesMut::with_capacity(8 + text.len());
    buf.put_u64(u64::from(err.code()));
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

/// Reads an [`Kind::Error`] payload back into an [`OrbError`].
///
/// Codes outside the HTTP range become 500.
#[must_use]
pub fn decode_error(mut data: &[u8]) -> OrbError {
    if data.remaining() < 8 {
        return OrbError::INTERNAL_SERVER_ERROR.wrap(String::from_utf8_lossy(data).into_owned());
    }
    let code = data.get_u64();
    OrbError::from_drpc_code(code, &String::from_utf8_lossy(data))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encoded(Frame::new(1, 2, Kind::Invoke, Bytes::from_static(b"/a/B")));
        assert_eq!(&buf[..], &[0b0000_0011, 1, 2, 4, b'/', b'a', b'/', b'B']);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let full = encoded(Frame::new(300, 1, Kind::Message, vec![7u8; 200]));
        let mut codec = FrameCodec;
        for cut in [0, 1, 2, 4, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut at {cut}");
        }
        let mut buf = full.clone();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream, 300);
        assert_eq!(frame.data.len(), 200);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encoded(Frame::new(1, 1, Kind::Message, Bytes::from_static(b"x")));
        buf.extend_from_slice(&encoded(Frame::new(1, 2, Kind::CloseSend, Bytes::new())));
        let mut codec = FrameCodec;
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind, Kind::Message);
        let close = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((close.kind, close.message), (Kind::CloseSend, 2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_control_frames_are_skipped() {
        let mut buf = BytesMut::from(&[CONTROL_BIT | (9 << 1) | DONE_BIT, 1, 1, 1, 0xff][..]);
        buf.extend_from_slice(&encoded(Frame::new(1, 1, Kind::Close, Bytes::new())));
        assert_eq!(FrameCodec.decode(&mut buf).unwrap().unwrap().kind, Kind::Close);
    }

    #[test]
    fn test_rejects_oversized_and_unknown() {
        let mut buf = BytesMut::new();
        buf.put_u8(((Kind::Message as u8) << 1) | DONE_BIT);
        encode_varint(1, &mut buf);
        encode_varint(1, &mut buf);
        encode_varint(MAX_FRAME_SIZE as u64 + 1, &mut buf);
        assert!(matches!(FrameCodec.decode(&mut buf), Err(WireError::TooLarge(_))));

        let mut buf = BytesMut::from(&[(12 << 1) | DONE_BIT, 1, 1, 0][..]);
        assert!(matches!(FrameCodec.decode(&mut buf), Err(WireError::UnknownKind(12))));

        let mut buf = BytesMut::from(&[DONE_BIT, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(FrameCodec.decode(&mut buf), Err(WireError::Varint)));
    }

    #[test]
    fn test_error_payload_keeps_code() {
        let err = decode_error(&encode_error(&OrbError::new(401, "who are you")));
        assert_eq!(err.code(), 401);
        assert_eq!(err.message(), "who are you");

        let mut odd = BytesMut::new();
        odd.put_u64(7);
        odd.put_slice(b"weird");
        assert_eq!(decode_error(&odd).code(), 500);
        assert_eq!(decode_error(b"short").code(), 500);
    }

    #[test]
    fn test_io_errors_are_unavailable() {
        let err = OrbError::from(WireError::Io(std::io::ErrorKind::BrokenPipe.into()));
        assert_eq!(err.code(), 503);
        assert_eq!(OrbError::from(WireError::Varint).code(), 500);
    }
}
