use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::wire::{ensure, get_entity_addr, put_entity_addr};
use crate::message::Message;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Frame header: body length then crc32c of the body, both big endian.
pub const FRAME_HEADER_LEN: usize = 8;

const FRAME_KIND_HELLO: u8 = 1;
const FRAME_KIND_MESSAGE: u8 = 2;

/// First frame on every connection, identifying the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// `None` while the sender is still waiting for the namer to assign one.
    pub from_rank: Option<u32>,
    /// Random id of the sender instance; sequence numbers are scoped to it.
    pub session: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Message { seq: u64, message: Message },
}

/// Length delimited, checksummed frames. Encoding and decoding are exact
/// inverses of each other.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }

    pub fn check(&self, buffer: &mut BytesMut) -> AppResult<()> {
        if buffer.remaining() < FRAME_HEADER_LEN {
            return Err(Incomplete);
        }
        let body_size = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if body_size == 0 {
            return Err(AppError::MalformedFrame("empty frame".to_string()));
        }
        if body_size > self.max_frame_size {
            return Err(AppError::FrameTooLarge(body_size));
        }
        if buffer.remaining() < body_size + FRAME_HEADER_LEN {
            buffer.reserve(body_size + FRAME_HEADER_LEN - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(())
    }

    pub fn parse(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        // perform a check to ensure we have enough data
        match self.check(buffer) {
            Ok(_) => {
                let body_length = buffer.get_u32() as usize;
                let expected = buffer.get_u32();
                let body = buffer.split_to(body_length).freeze();
                let computed = crc32c::crc32c(&body);
                if computed != expected {
                    return Err(AppError::ChecksumMismatch { expected, computed });
                }
                Self::parse_body(body).map(Some)
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn parse_body(mut body: bytes::Bytes) -> AppResult<Frame> {
        match body.get_u8() {
            FRAME_KIND_HELLO => {
                ensure(&body, 13, "hello")?;
                let has_rank = body.get_u8();
                let rank = body.get_u32();
                let session = body.get_u64();
                Ok(Frame::Hello(Hello {
                    from_rank: (has_rank == 1).then_some(rank),
                    session,
                }))
            }
            FRAME_KIND_MESSAGE => {
                ensure(&body, 8, "sequence")?;
                let seq = body.get_u64();
                let source = get_entity_addr(&mut body)?;
                ensure(&body, 4, "source port")?;
                let source_port = body.get_u32();
                let dest = get_entity_addr(&mut body)?;
                ensure(&body, 8, "dest port and type")?;
                let dest_port = body.get_u32();
                let msg_type = body.get_u32();
                Ok(Frame::Message {
                    seq,
                    message: Message {
                        source,
                        source_port,
                        dest,
                        dest_port,
                        msg_type,
                        payload: body,
                    },
                })
            }
            kind => Err(AppError::MalformedFrame(format!("unknown frame kind {}", kind))),
        }
    }

    pub fn encode_hello(&self, hello: &Hello, dst: &mut BytesMut) -> AppResult<()> {
        let mut body = BytesMut::with_capacity(14);
        body.put_u8(FRAME_KIND_HELLO);
        body.put_u8(hello.from_rank.is_some() as u8);
        body.put_u32(hello.from_rank.unwrap_or(0));
        body.put_u64(hello.session);
        self.put_frame(&body, dst)
    }

    /// Encodes by reference so a sender can keep the message until the write
    /// has succeeded.
    pub fn encode_message(&self, seq: u64, message: &Message, dst: &mut BytesMut) -> AppResult<()> {
        let mut body = BytesMut::with_capacity(35 + message.payload.len());
        body.put_u8(FRAME_KIND_MESSAGE);
        body.put_u64(seq);
        put_entity_addr(&mut body, &message.source);
        body.put_u32(message.source_port);
        put_entity_addr(&mut body, &message.dest);
        body.put_u32(message.dest_port);
        body.put_u32(message.msg_type);
        body.put_slice(&message.payload);
        self.put_frame(&body, dst)
    }

    fn put_frame(&self, body: &[u8], dst: &mut BytesMut) -> AppResult<()> {
        if body.len() > self.max_frame_size {
            return Err(AppError::FrameTooLarge(body.len()));
        }
        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_u32(crc32c::crc32c(body));
        dst.put_slice(body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Frame>> {
        self.parse(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> AppResult<()> {
        match frame {
            Frame::Hello(hello) => self.encode_hello(&hello, dst),
            Frame::Message { seq, message } => self.encode_message(seq, &message, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EntityAddr, EntityType, MSG_TYPE_USER_BASE};

    fn sample_message() -> Message {
        Message {
            source: EntityAddr::new(EntityType::Client, 1),
            source_port: 3,
            dest: EntityAddr::new(EntityType::Osd, 2),
            dest_port: 4,
            msg_type: MSG_TYPE_USER_BASE + 7,
            payload: bytes::Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new(1024);
        let mut encoded = BytesMut::new();
        codec.encode_message(11, &sample_message(), &mut encoded).unwrap();

        let mut partial = encoded.split_to(encoded.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(encoded);
        match codec.decode(&mut partial).unwrap() {
            Some(Frame::Message { seq, message }) => {
                assert_eq!(seq, 11);
                assert_eq!(message, sample_message());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(partial.is_empty());
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let mut codec = FrameCodec::new(1024);
        let mut encoded = BytesMut::new();
        codec
            .encode(
                Frame::Hello(Hello {
                    from_rank: Some(2),
                    session: 42,
                }),
                &mut encoded,
            )
            .unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            codec.decode(&mut encoded),
            Err(AppError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_both_ways() {
        let codec = FrameCodec::new(64);
        let mut big = sample_message();
        big.payload = bytes::Bytes::from(vec![0u8; 128]);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode_message(1, &big, &mut dst),
            Err(AppError::FrameTooLarge(_))
        ));
        assert!(dst.is_empty());

        let mut header = BytesMut::new();
        header.put_u32(1000);
        header.put_u32(0);
        assert!(matches!(
            codec.parse(&mut header),
            Err(AppError::FrameTooLarge(1000))
        ));
    }
}
