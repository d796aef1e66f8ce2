//! Frame codec collaborators.
//!
//! The pools do not define a wire protocol. They only need to cut a byte
//! stream into frames:
//!
//! - the exclusive pool binds one [`Framer`] (built by a [`FramerBuilder`])
//!   to each pooled connection so callers can read one complete frame at a time
//! - the multiplexed pool uses a shared [`FrameParser`] that also extracts the
//!   stream id, which is how inbound frames are routed to virtual connections
//!
//! Both are incremental, sans-IO decoders over a [`BytesMut`] buffer. They
//! return `Ok(None)` when the buffer does not yet hold a complete frame.
//!
//! [`LengthDelimited`] and [`StreamFramed`] are simple default codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ErrorKind;

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Errors raised while decoding frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Reads one complete frame at a time from a connection's read buffer.
pub trait Framer: Send + Sync {
    /// Split one frame off the front of `buf`, or return `Ok(None)` if more
    /// bytes are needed.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError>;
}

/// Creates a [`Framer`] for each new pooled connection.
pub trait FramerBuilder: Send + Sync {
    fn build(&self) -> Box<dyn Framer>;
}

/// Parses frames off a shared multiplexed connection.
pub trait FrameParser: Send + Sync {
    /// Split one frame off the front of `buf` and return its stream id with
    /// the frame bytes, or `Ok(None)` if more bytes are needed.
    fn parse(&self, buf: &mut BytesMut) -> Result<Option<(u32, Bytes)>, FrameError>;
}

/// Frames prefixed by a 4-byte big-endian payload length.
///
/// Decoded frames are the payload only.
#[derive(Debug, Clone, Copy)]
pub struct LengthDelimited {
    pub max_frame_len: usize,
}

impl Default for LengthDelimited {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl LengthDelimited {
    pub const HEADER_LEN: usize = 4;

    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Encode `payload` with its length prefix
    pub fn encode(payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        out.freeze()
    }
}

impl Framer for LengthDelimited {
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        if buf.len() < Self::HEADER_LEN + len {
            buf.reserve(Self::HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_LEN);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl FramerBuilder for LengthDelimited {
    fn build(&self) -> Box<dyn Framer> {
        Box::new(*self)
    }
}

/// Frames with an 8-byte header: stream id then payload length, both
/// big-endian `u32`.
///
/// Parsed frames include the header so the caller's codec sees the whole
/// message it sent or received.
#[derive(Debug, Clone, Copy)]
pub struct StreamFramed {
    pub max_frame_len: usize,
}

impl Default for StreamFramed {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl StreamFramed {
    pub const HEADER_LEN: usize = 8;

    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn encode(stream_id: u32, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        out.put_u32(stream_id);
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        out.freeze()
    }

    /// Split a parsed frame into stream id and payload
    pub fn decode_frame(frame: &Bytes) -> Result<(u32, Bytes), FrameError> {
        if frame.len() < Self::HEADER_LEN {
            return Err(FrameError::Malformed(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        Ok((id, frame.slice(Self::HEADER_LEN..)))
    }
}

impl FrameParser for StreamFramed {
    fn parse(&self, buf: &mut BytesMut) -> Result<Option<(u32, Bytes)>, FrameError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        let total = Self::HEADER_LEN + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        Ok(Some((id, buf.split_to(total).freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_delimited_partial_then_complete() {
        let encoded = LengthDelimited::encode(b"hello");
        let mut framer = LengthDelimited::default();

        let mut buf = BytesMut::from(&encoded[..6]);
        assert_eq!(framer.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[6..]);
        assert_eq!(framer.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_delimited_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&LengthDelimited::encode(b"a"));
        buf.extend_from_slice(&LengthDelimited::encode(b"bc"));

        let mut framer = LengthDelimited::default();
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "a");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "bc");
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_length_delimited_oversized() {
        let mut framer = LengthDelimited::new(4);
        let mut buf = BytesMut::from(&LengthDelimited::encode(b"too long")[..]);
        assert_eq!(
            framer.decode(&mut buf),
            Err(FrameError::Oversized { len: 8, max: 4 })
        );
    }

    #[test]
    fn test_stream_framed_extracts_id() {
        let parser = StreamFramed::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&StreamFramed::encode(7, b"ping"));
        buf.extend_from_slice(&StreamFramed::encode(9, b""));

        let (id, frame) = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(StreamFramed::decode_frame(&frame).unwrap(), (7, Bytes::from_static(b"ping")));

        let (id, frame) = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(id, 9);
        assert_eq!(frame.len(), StreamFramed::HEADER_LEN);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_framed_incomplete_header() {
        let parser = StreamFramed::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0][..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_decode_frame_too_short() {
        let frame = Bytes::from_static(b"abc");
        assert!(matches!(
            StreamFramed::decode_frame(&frame),
            Err(FrameError::Malformed(_))
        ));
    }
}
