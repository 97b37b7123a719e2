//! Length-prefixed frame codec.
//!
//! Stream layout: `u32 length | i32 type | i64 message_id | body`, big
//! endian, where `length` counts everything after itself (so at least 12).
//! The decoder is a [`tokio_util::codec::Decoder`] and therefore handles a
//! frame split across reads as well as several frames coalesced into one
//! buffer — a naive read-whatever-is-buffered decode is only valid for
//! datagrams, where one datagram is one frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_BODY_SIZE;
use crate::core::frame::Frame;
use crate::error::ProtocolError;

/// Fixed header bytes after the length prefix: type (4) + message id (8).
const FRAME_HEADER_LEN: usize = 12;

/// Codec for [`Frame`]s over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::OversizedFrame(frame.body.len()));
        }
        dst.reserve(4 + frame.encoded_len());
        dst.put_u32(frame.encoded_len() as u32);
        dst.put_i32(frame.frame_type);
        dst.put_i64(frame.message_id);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length < FRAME_HEADER_LEN {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Frame length {length} shorter than header"
            )));
        }
        if length - FRAME_HEADER_LEN > MAX_BODY_SIZE {
            return Err(ProtocolError::OversizedFrame(length - FRAME_HEADER_LEN));
        }

        if src.len() < 4 + length {
            // Partial frame, wait for more bytes.
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_i32();
        let message_id = src.get_i64();
        let body = src.split_to(length - FRAME_HEADER_LEN).freeze();

        Ok(Some(Frame {
            frame_type,
            message_id,
            body,
        }))
    }
}

/// Encode one frame as a standalone datagram payload.
pub fn encode_datagram(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(4 + frame.encoded_len());
    FrameCodec.encode(frame.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one frame from a complete datagram payload.
pub fn decode_datagram(datagram: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::from(datagram);
    match FrameCodec.decode(&mut buf)? {
        Some(frame) if buf.is_empty() => Ok(frame),
        Some(_) => Err(ProtocolError::ProtocolViolation(
            "Trailing bytes after datagram frame".to_string(),
        )),
        None => Err(ProtocolError::ProtocolViolation(
            "Truncated datagram frame".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: i32, id: i64, body: &[u8]) -> Frame {
        Frame::new(t, id, Bytes::copy_from_slice(body))
    }

    #[test]
    fn roundtrip_single_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let f = frame(3, 99, b"payload");
        codec.encode(f.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, f);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_frame_split_across_reads() {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        codec.encode(frame(1, 7, b"split-me"), &mut wire).unwrap();

        // Feed the buffer one byte at a time; only the last byte yields a frame.
        let mut buf = BytesMut::new();
        let total = wire.len();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < total {
                assert!(result.is_none(), "frame completed early at byte {i}");
            } else {
                let f = result.unwrap();
                assert_eq!(f.message_id, 7);
                assert_eq!(&f.body[..], b"split-me");
            }
        }
    }

    #[test]
    fn decodes_multiple_frames_from_one_buffer() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame(1, 1, b"a"), &mut buf).unwrap();
        codec.encode(frame(2, 2, b"bb"), &mut buf).unwrap();
        codec.encode(frame(3, 3, b""), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.frame_type, &first.body[..]), (1, &b"a"[..]));
        assert_eq!((second.frame_type, &second.body[..]), (2, &b"bb"[..]));
        assert_eq!((third.frame_type, third.body.len()), (3, 0));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_undersized_length() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(4); // shorter than the 12-byte header
        buf.put_slice(&[0u8; 4]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rejects_oversized_body() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_LEN + MAX_BODY_SIZE + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(_))
        ));

        let too_big = Frame::new(0, 0, Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]));
        let mut out = BytesMut::new();
        assert!(matches!(
            codec.encode(too_big, &mut out),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn datagram_roundtrip_and_trailing_rejection() {
        let f = frame(9, 1234, b"dgram");
        let bytes = encode_datagram(&f).unwrap();
        assert_eq!(decode_datagram(&bytes).unwrap(), f);

        let mut trailing = bytes.to_vec();
        trailing.push(0xFF);
        assert!(decode_datagram(&trailing).is_err());
        assert!(decode_datagram(&bytes[..bytes.len() - 1]).is_err());
    }
}
