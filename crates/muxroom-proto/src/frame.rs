//! muxrpc frame header and codec
//!
//! Every frame is a 9 byte header followed by the body:
//!
//! ```text
//! +-------+-----------------+-----------------+
//! | flags | body length u32 | request no. i32 |
//! +-------+-----------------+-----------------+
//! ```
//!
//! The request number is positive on frames sent by the side that opened the
//! call and negated on frames sent back by the responder.

use crate::body::RawBody;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Encoding of a frame body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BodyType {
    Binary = 0,
    Text = 1,
    Json = 2,
}

impl TryFrom<u8> for BodyType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BodyType::Binary),
            1 => Ok(BodyType::Text),
            2 => Ok(BodyType::Json),
            _ => Err(FrameError::InvalidBodyType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const STREAM: u8 = 0b0000_1000;
    pub const END: u8 = 0b0000_0100;
    const BODY_TYPE: u8 = 0b0000_0011;

    pub fn new(body_type: BodyType) -> Self {
        Self(body_type as u8)
    }

    pub fn with_stream(mut self) -> Self {
        self.0 |= Self::STREAM;
        self
    }

    pub fn with_end(mut self) -> Self {
        self.0 |= Self::END;
        self
    }

    pub fn is_stream(&self) -> bool {
        self.0 & Self::STREAM != 0
    }

    /// Set on the last frame of a stream and on error responses.
    pub fn is_end(&self) -> bool {
        self.0 & Self::END != 0
    }

    pub fn body_type(&self) -> Result<BodyType, FrameError> {
        BodyType::try_from(self.body_bits())
    }

    /// The body type bits as they are, valid or not
    pub fn body_bits(&self) -> u8 {
        self.0 & Self::BODY_TYPE
    }

    /// Flags carrying only the given body type bits
    pub fn from_body_bits(bits: u8) -> Self {
        Self(bits & Self::BODY_TYPE)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single muxrpc frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    pub req: i32,
    pub body: Bytes,
}

impl Frame {
    /// Frame header size: flags (1) + length (4) + request number (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(req: i32, flags: Flags, body: Bytes) -> Self {
        Self { flags, req, body }
    }

    /// The all-zero frame announcing that the sender is closing the connection.
    pub fn goodbye() -> Self {
        Self {
            flags: Flags::from_u8(0),
            req: 0,
            body: Bytes::new(),
        }
    }

    pub fn is_goodbye(&self) -> bool {
        self.req == 0 && self.flags.as_u8() == 0 && self.body.is_empty()
    }

    /// The body exactly as it arrived, without decoding it.
    pub fn raw_body(&self) -> RawBody {
        RawBody::from_bits(self.flags.body_bits(), self.body.clone())
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = self.body.len();
        if len > u32::MAX as usize {
            return Err(FrameError::FrameTooLarge(len));
        }

        dst.reserve(Self::HEADER_SIZE + len);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(len as u32);
        dst.put_i32(self.req);
        dst.put_slice(&self.body);
        Ok(())
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid body type: {0}")]
    InvalidBodyType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed muxrpc codec for `FramedRead`/`FramedWrite`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size as usize,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Frame::HEADER_SIZE];
        let flags = Flags::from_u8(header.get_u8());
        let length = header.get_u32() as usize;
        let req = header.get_i32();

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let body = src.split_to(length).freeze();

        Ok(Some(Frame { flags, req, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.body.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(frame.body.len()));
        }
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(
            -7,
            Flags::new(BodyType::Json).with_stream().with_end(),
            Bytes::from_static(b"true"),
        );

        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();

        assert_eq!(buf.len(), Frame::HEADER_SIZE + 4);
        assert_eq!(buf[0], 0b0000_1110);
        assert_eq!(&buf[1..5], &[0, 0, 0, 4]);
        assert_eq!(&buf[5..9], &(-7i32).to_be_bytes());
        assert_eq!(&buf[9..], b"true");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let frame = Frame::new(3, Flags::new(BodyType::Binary), Bytes::from("hello"));
        let mut encoded = BytesMut::new();
        frame.encode_into(&mut encoded).unwrap();

        let mut codec = FrameCodec::default();
        let mut partial = BytesMut::from(&encoded[..11]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[11..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let mut codec = FrameCodec::new(16);
        let frame = Frame::new(1, Flags::new(BodyType::Binary), Bytes::from(vec![0u8; 17]));
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge(17))
        ));
    }

    #[test]
    fn test_goodbye_is_all_zero() {
        let mut buf = BytesMut::new();
        Frame::goodbye().encode_into(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0u8; 9]);

        let decoded = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_goodbye());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::new(BodyType::Text).with_stream();
        assert!(flags.is_stream());
        assert!(!flags.is_end());
        assert_eq!(flags.body_type().unwrap(), BodyType::Text);

        assert!(matches!(
            Flags::from_u8(0b11).body_type(),
            Err(FrameError::InvalidBodyType(3))
        ));
    }

    #[test]
    fn test_raw_body_keeps_bytes_and_type_bits() {
        let json = Frame::new(
            4,
            Flags::new(BodyType::Json).with_stream(),
            Bytes::from_static(b"{\"b\":1,  \"a\":2.50}"),
        );
        let raw = json.raw_body();
        assert_eq!(raw.body_type().unwrap(), BodyType::Json);
        assert_eq!(&raw.bytes()[..], b"{\"b\":1,  \"a\":2.50}");

        let odd = Frame::new(4, Flags::from_u8(0b1011), Bytes::from_static(b"?"));
        let raw = odd.raw_body();
        assert_eq!(raw.body_bits(), 3);
        assert!(raw.clone().decode().is_err());
        assert_eq!(Flags::from_body_bits(raw.body_bits()).as_u8(), 0b11);
    }
}
