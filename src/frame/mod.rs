//! Frame model for the multiplexed wire protocol.
//!
//! Every unit on the wire is a [`Frame`]: a 9-byte header (24-bit payload
//! length, kind, flags and a 31-bit stream identifier) followed by exactly
//! `length` payload bytes. Stream `0` addresses the connection itself.
//!
//! Header blocks carried by `HEADERS` and `CONTINUATION` frames are opaque
//! metadata; this crate never interprets them.

mod codec;
mod error;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
pub use codec::{FRAME_HEADER_LEN, FrameCodec};
pub use error::{CodecError, FrameError};

use crate::byte_order::{
    read_network_u16,
    read_network_u31,
    read_network_u32,
    write_network_u16,
    write_network_u31,
    write_network_u32,
};

/// Smallest maximum frame size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
/// Largest maximum frame size a peer may advertise.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;
/// Default maximum frame size before settings are exchanged.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = MIN_MAX_FRAME_SIZE;

/// Frame flag bits.
pub mod flags {
    /// Last frame the sender will emit on the stream.
    pub const END_STREAM: u8 = 0x1;
    /// Acknowledgement of a `SETTINGS` or `PING` frame.
    pub const ACK: u8 = 0x1;
    /// The header block is complete.
    pub const END_HEADERS: u8 = 0x4;
    /// The payload is preceded by a pad length and followed by padding.
    pub const PADDED: u8 = 0x8;
    /// A `HEADERS` payload carries an inline priority block.
    pub const PRIORITY: u8 = 0x20;
}

/// Identifier of a stream; `0` refers to the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    /// Connection-scoped identifier.
    pub const ZERO: StreamId = StreamId(0);
    /// Highest representable identifier.
    pub const MAX: StreamId = StreamId(crate::byte_order::U31_MASK);

    /// Create a stream identifier, discarding the reserved high bit.
    #[must_use]
    pub const fn new(id: u32) -> Self { Self(id & crate::byte_order::U31_MASK) }

    /// Return the raw identifier.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }

    /// Returns `true` for the connection-scoped identifier.
    #[must_use]
    pub const fn is_zero(self) -> bool { self.0 == 0 }

    /// Returns `true` for identifiers a client may open (odd numbers).
    #[must_use]
    pub const fn is_client_initiated(self) -> bool { self.0 % 2 == 1 }
}

impl From<u32> for StreamId {
    fn from(value: u32) -> Self { Self::new(value) }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Kind of a frame as carried in the header's type octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Stream payload bytes, subject to flow control.
    Data,
    /// Opens a stream (or carries trailing metadata).
    Headers,
    /// Adjusts the scheduling weight of a stream.
    Priority,
    /// Terminates a single stream.
    RstStream,
    /// Connection settings exchange.
    Settings,
    /// Server push announcement; never valid from a client.
    PushPromise,
    /// Keepalive round trip.
    Ping,
    /// Announces the last stream the sender will process.
    GoAway,
    /// Grants flow-control credit.
    WindowUpdate,
    /// Continues a header block.
    Continuation,
    /// A kind this crate does not understand; ignored on receipt.
    Unknown(u8),
}

impl FrameKind {
    /// Return the wire representation of the kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns `true` if frames of this kind must target stream `0`.
    #[must_use]
    pub const fn is_connection_scoped(self) -> bool {
        matches!(self, Self::Settings | Self::Ping | Self::GoAway)
    }

    /// Returns `true` if frames of this kind must target a non-zero stream.
    #[must_use]
    pub const fn is_stream_scoped(self) -> bool {
        matches!(
            self,
            Self::Data
                | Self::Headers
                | Self::Priority
                | Self::RstStream
                | Self::PushPromise
                | Self::Continuation
        )
    }
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

/// Error codes carried by `RST_STREAM` and `GOAWAY` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl ErrorCode {
    /// Return the wire representation of the code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::NoError => 0x0,
            Self::ProtocolError => 0x1,
            Self::InternalError => 0x2,
            Self::FlowControlError => 0x3,
            Self::SettingsTimeout => 0x4,
            Self::StreamClosed => 0x5,
            Self::FrameSizeError => 0x6,
            Self::RefusedStream => 0x7,
            Self::Cancel => 0x8,
            Self::CompressionError => 0x9,
            Self::ConnectError => 0xa,
            Self::EnhanceYourCalm => 0xb,
            Self::InadequateSecurity => 0xc,
            Self::Http11Required => 0xd,
        }
    }
}

impl From<u32> for ErrorCode {
    /// Unknown codes carry no special meaning and map to `InternalError`.
    fn from(value: u32) -> Self {
        match value {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// A single connection setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(u32),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    /// Unknown identifiers must be ignored by the receiver.
    Unknown(u16, u32),
}

impl Setting {
    /// Length of one encoded setting.
    pub const ENCODED_LEN: usize = 6;

    fn from_parts(id: u16, value: u32) -> Self {
        match id {
            0x1 => Self::HeaderTableSize(value),
            0x2 => Self::EnablePush(value),
            0x3 => Self::MaxConcurrentStreams(value),
            0x4 => Self::InitialWindowSize(value),
            0x5 => Self::MaxFrameSize(value),
            0x6 => Self::MaxHeaderListSize(value),
            other => Self::Unknown(other, value),
        }
    }

    fn parts(self) -> (u16, u32) {
        match self {
            Self::HeaderTableSize(v) => (0x1, v),
            Self::EnablePush(v) => (0x2, v),
            Self::MaxConcurrentStreams(v) => (0x3, v),
            Self::InitialWindowSize(v) => (0x4, v),
            Self::MaxFrameSize(v) => (0x5, v),
            Self::MaxHeaderListSize(v) => (0x6, v),
            Self::Unknown(id, v) => (id, v),
        }
    }
}

/// Priority block carried by `PRIORITY` frames and prioritised `HEADERS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Stream this stream depends on.
    pub dependency: StreamId,
    /// Whether the dependency is exclusive.
    pub exclusive: bool,
    /// Scheduling weight minus one (`0..=255` maps to `1..=256`).
    pub weight: u8,
}

impl PrioritySpec {
    /// Encoded length of a priority block.
    pub const ENCODED_LEN: usize = 5;

    fn parse(bytes: &[u8]) -> Option<Self> {
        let block: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        let weight = *bytes.get(4)?;
        Some(Self {
            dependency: StreamId::new(read_network_u31(block)),
            exclusive: block[0] & 0x80 != 0,
            weight,
        })
    }
}

/// Decoded `GOAWAY` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoAway {
    /// Highest stream identifier the sender will process.
    pub last_stream_id: StreamId,
    /// Reason for closing the connection.
    pub error_code: ErrorCode,
    /// Opaque diagnostic bytes.
    pub debug_data: Bytes,
}

/// A decoded frame.
///
/// The payload length is always derived from `payload`, so a frame can never
/// be serialised with a length that disagrees with its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    flags: u8,
    stream_id: StreamId,
    payload: Bytes,
}

impl Frame {
    /// Construct a frame from raw parts.
    #[must_use]
    pub fn new(kind: FrameKind, flags: u8, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind,
            flags,
            stream_id,
            payload,
        }
    }

    /// Construct a `DATA` frame.
    #[must_use]
    pub fn data(stream_id: StreamId, payload: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream { flags::END_STREAM } else { 0 };
        Self::new(FrameKind::Data, flags, stream_id, payload)
    }

    /// Construct a `HEADERS` frame carrying (part of) a header block.
    #[must_use]
    pub fn headers(stream_id: StreamId, block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        let mut bits = 0;
        if end_stream {
            bits |= flags::END_STREAM;
        }
        if end_headers {
            bits |= flags::END_HEADERS;
        }
        Self::new(FrameKind::Headers, bits, stream_id, block)
    }

    /// Construct a `CONTINUATION` frame.
    #[must_use]
    pub fn continuation(stream_id: StreamId, block: Bytes, end_headers: bool) -> Self {
        let flags = if end_headers { flags::END_HEADERS } else { 0 };
        Self::new(FrameKind::Continuation, flags, stream_id, block)
    }

    /// Construct a `PRIORITY` frame.
    #[must_use]
    pub fn priority(stream_id: StreamId, spec: PrioritySpec) -> Self {
        let mut buf = BytesMut::with_capacity(PrioritySpec::ENCODED_LEN);
        let mut dependency = write_network_u31(spec.dependency.get());
        if spec.exclusive {
            dependency[0] |= 0x80;
        }
        buf.put_slice(&dependency);
        buf.put_u8(spec.weight);
        Self::new(FrameKind::Priority, 0, stream_id, buf.freeze())
    }

    /// Construct an `RST_STREAM` frame.
    #[must_use]
    pub fn reset(stream_id: StreamId, code: ErrorCode) -> Self {
        let payload = Bytes::copy_from_slice(&write_network_u32(code.as_u32()));
        Self::new(FrameKind::RstStream, 0, stream_id, payload)
    }

    /// Construct a `SETTINGS` frame.
    #[must_use]
    pub fn settings(settings: &[Setting]) -> Self {
        let mut buf = BytesMut::with_capacity(settings.len() * Setting::ENCODED_LEN);
        for setting in settings {
            let (id, value) = setting.parts();
            buf.put_slice(&write_network_u16(id));
            buf.put_slice(&write_network_u32(value));
        }
        Self::new(FrameKind::Settings, 0, StreamId::ZERO, buf.freeze())
    }

    /// Construct an empty `SETTINGS` acknowledgement.
    #[must_use]
    pub fn settings_ack() -> Self {
        Self::new(FrameKind::Settings, flags::ACK, StreamId::ZERO, Bytes::new())
    }

    /// Construct a `PING` frame.
    #[must_use]
    pub fn ping(opaque: [u8; 8], ack: bool) -> Self {
        let flags = if ack { flags::ACK } else { 0 };
        Self::new(
            FrameKind::Ping,
            flags,
            StreamId::ZERO,
            Bytes::copy_from_slice(&opaque),
        )
    }

    /// Construct a `GOAWAY` frame.
    #[must_use]
    pub fn go_away(last_stream_id: StreamId, code: ErrorCode, debug_data: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(8 + debug_data.len());
        buf.put_slice(&write_network_u31(last_stream_id.get()));
        buf.put_slice(&write_network_u32(code.as_u32()));
        buf.put_slice(&debug_data);
        Self::new(FrameKind::GoAway, 0, StreamId::ZERO, buf.freeze())
    }

    /// Construct a `WINDOW_UPDATE` frame.
    #[must_use]
    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        let payload = Bytes::copy_from_slice(&write_network_u31(increment));
        Self::new(FrameKind::WindowUpdate, 0, stream_id, payload)
    }

    #[must_use]
    pub fn kind(&self) -> FrameKind { self.kind }

    #[must_use]
    pub fn flags(&self) -> u8 { self.flags }

    #[must_use]
    pub fn stream_id(&self) -> StreamId { self.stream_id }

    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.payload.len() }

    /// Returns `true` when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.payload.is_empty() }

    /// Returns `true` if every bit in `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool { self.flags & flag == flag }

    #[must_use]
    pub fn is_end_stream(&self) -> bool {
        matches!(self.kind, FrameKind::Data | FrameKind::Headers) && self.has_flag(flags::END_STREAM)
    }

    #[must_use]
    pub fn is_end_headers(&self) -> bool {
        matches!(self.kind, FrameKind::Headers | FrameKind::Continuation)
            && self.has_flag(flags::END_HEADERS)
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self.kind, FrameKind::Settings | FrameKind::Ping) && self.has_flag(flags::ACK)
    }

    /// Return the content of a `DATA` or `HEADERS` payload with padding and
    /// any inline priority block removed, together with that priority block.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPadding`] if the pad length exceeds the
    /// payload.
    pub fn content(&self) -> Result<(Bytes, Option<PrioritySpec>), FrameError> {
        let mut body = self.payload.clone();
        let mut pad = 0usize;
        if self.has_flag(flags::PADDED) {
            let Some(&len) = body.first() else {
                return Err(FrameError::InvalidPadding {
                    stream_id: self.stream_id,
                });
            };
            pad = usize::from(len);
            body = body.slice(1..);
        }
        let mut priority = None;
        if self.kind == FrameKind::Headers && self.has_flag(flags::PRIORITY) {
            priority = PrioritySpec::parse(&body);
            if priority.is_none() {
                return Err(FrameError::InvalidPayloadLength {
                    kind: self.kind,
                    len: self.payload.len(),
                });
            }
            body = body.slice(PrioritySpec::ENCODED_LEN..);
        }
        if pad > body.len() {
            return Err(FrameError::InvalidPadding {
                stream_id: self.stream_id,
            });
        }
        body.truncate(body.len() - pad);
        Ok((body, priority))
    }

    /// Decode an `RST_STREAM` error code.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is not four bytes.
    pub fn reset_code(&self) -> Result<ErrorCode, FrameError> {
        self.fixed_u32().map(ErrorCode::from)
    }

    /// Decode a `WINDOW_UPDATE` increment.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is not four bytes.
    pub fn window_increment(&self) -> Result<u32, FrameError> {
        self.fixed_u32().map(|raw| raw & crate::byte_order::U31_MASK)
    }

    /// Decode the opaque bytes of a `PING` frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is not eight bytes.
    pub fn ping_payload(&self) -> Result<[u8; 8], FrameError> {
        <[u8; 8]>::try_from(self.payload.as_ref()).map_err(|_| self.length_error())
    }

    /// Decode a `PRIORITY` frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is not five bytes.
    pub fn priority_spec(&self) -> Result<PrioritySpec, FrameError> {
        if self.payload.len() != PrioritySpec::ENCODED_LEN {
            return Err(self.length_error());
        }
        PrioritySpec::parse(&self.payload).ok_or_else(|| self.length_error())
    }

    /// Decode a `GOAWAY` payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is shorter
    /// than eight bytes.
    pub fn go_away_payload(&self) -> Result<GoAway, FrameError> {
        let last: [u8; 4] = self
            .payload
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| self.length_error())?;
        let code: [u8; 4] = self
            .payload
            .get(4..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| self.length_error())?;
        Ok(GoAway {
            last_stream_id: StreamId::new(read_network_u31(last)),
            error_code: ErrorCode::from(read_network_u32(code)),
            debug_data: self.payload.slice(8..),
        })
    }

    /// Decode the settings carried by a `SETTINGS` frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayloadLength`] if the payload is not a
    /// multiple of six bytes.
    pub fn settings_payload(&self) -> Result<Vec<Setting>, FrameError> {
        if self.payload.len() % Setting::ENCODED_LEN != 0 {
            return Err(self.length_error());
        }
        Ok(self
            .payload
            .chunks_exact(Setting::ENCODED_LEN)
            .map(|chunk| {
                let id = read_network_u16([chunk[0], chunk[1]]);
                let value = read_network_u32([chunk[2], chunk[3], chunk[4], chunk[5]]);
                Setting::from_parts(id, value)
            })
            .collect())
    }

    fn fixed_u32(&self) -> Result<u32, FrameError> {
        <[u8; 4]>::try_from(self.payload.as_ref())
            .map(read_network_u32)
            .map_err(|_| self.length_error())
    }

    fn length_error(&self) -> FrameError {
        FrameError::InvalidPayloadLength {
            kind: self.kind,
            len: self.payload.len(),
        }
    }
}
