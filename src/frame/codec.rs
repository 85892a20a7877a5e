//! Tokio codec translating between bytes and [`Frame`] values.
//!
//! Used with `FramedRead` on the inbound half of a connection, the decoder
//! yields a lazy sequence of frames that ends when the transport closes.

use bytes::{Buf, BufMut, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    CodecError,
    DEFAULT_MAX_FRAME_SIZE,
    Frame,
    FrameError,
    FrameKind,
    MAX_MAX_FRAME_SIZE,
    MIN_MAX_FRAME_SIZE,
    StreamId,
};
use crate::byte_order::{read_network_u24, read_network_u31, write_network_u24, write_network_u31};

/// Length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug)]
struct Header {
    length: usize,
    kind: FrameKind,
    flags: u8,
    stream_id: StreamId,
}

impl Header {
    fn parse(src: &[u8]) -> Option<Self> {
        let length: [u8; 3] = src.get(..3)?.try_into().ok()?;
        let stream: [u8; 4] = src.get(5..9)?.try_into().ok()?;
        Some(Self {
            length: read_network_u24(length) as usize,
            kind: FrameKind::from(*src.get(3)?),
            flags: *src.get(4)?,
            stream_id: StreamId::new(read_network_u31(stream)),
        })
    }

    /// Reject frames whose scope or fixed size is wrong before buffering the payload.
    fn validate(&self) -> Result<(), FrameError> {
        let scope_ok = if self.kind.is_connection_scoped() {
            self.stream_id.is_zero()
        } else if self.kind.is_stream_scoped() {
            !self.stream_id.is_zero()
        } else {
            true
        };
        if !scope_ok {
            return Err(FrameError::InvalidStreamId {
                kind: self.kind,
                stream_id: self.stream_id,
            });
        }
        let fixed = match self.kind {
            FrameKind::Priority => Some(5),
            FrameKind::RstStream | FrameKind::WindowUpdate => Some(4),
            FrameKind::Ping => Some(8),
            _ => None,
        };
        let length_ok = match (self.kind, fixed) {
            (_, Some(expected)) => self.length == expected,
            (FrameKind::Settings, None) => self.length % 6 == 0,
            (FrameKind::GoAway, None) => self.length >= 8,
            _ => true,
        };
        if length_ok {
            Ok(())
        } else {
            Err(FrameError::InvalidPayloadLength {
                kind: self.kind,
                len: self.length,
            })
        }
    }
}

/// Frame codec bounded by a maximum payload size.
///
/// The decoding side enforces the locally advertised maximum; the encoding
/// side enforces the maximum the peer advertised.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    pending: Option<Header>,
}

impl FrameCodec {
    /// Construct a codec with `max_frame_size` clamped to the legal range.
    #[must_use]
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size.clamp(MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE) as usize,
            pending: None,
        }
    }

    /// Return the maximum payload size accepted by this codec.
    #[must_use]
    pub fn max_frame_size(&self) -> usize { self.max_frame_size }

    /// Replace the maximum payload size, clamped to the legal range.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size =
            max_frame_size.clamp(MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE) as usize;
    }
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_SIZE) }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                let Some(header) = Header::parse(src) else {
                    return Ok(None);
                };
                if header.length > self.max_frame_size {
                    return Err(FrameError::FrameTooLarge {
                        size: header.length,
                        max: self.max_frame_size,
                    }
                    .into());
                }
                header.validate()?;
                src.advance(FRAME_HEADER_LEN);
                header
            }
        };

        if src.len() < header.length {
            src.reserve(header.length - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.length).freeze();
        trace!(
            "frame decoded: kind={:?}, stream_id={}, flags={:#x}, len={}",
            header.kind, header.stream_id, header.flags, header.length
        );
        Ok(Some(Frame::new(
            header.kind,
            header.flags,
            header.stream_id,
            payload,
        )))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // Clean close only at a frame boundary.
        if src.is_empty() && self.pending.is_none() {
            return Ok(None);
        }
        let header_bytes = if self.pending.is_some() {
            FRAME_HEADER_LEN
        } else {
            0
        };
        Err(CodecError::Eof {
            bytes_received: src.len() + header_bytes,
        })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        dst.reserve(FRAME_HEADER_LEN + item.len());
        #[expect(
            clippy::cast_possible_truncation,
            reason = "length is bounded by max_frame_size which fits in 24 bits"
        )]
        dst.put_slice(&write_network_u24(item.len() as u32));
        dst.put_u8(item.kind().as_u8());
        dst.put_u8(item.flags());
        dst.put_slice(&write_network_u31(item.stream_id().get()));
        dst.put_slice(item.payload());
        Ok(())
    }
}
