//! Error types for the frame codec.
//!
//! - [`FrameError`]: a frame violates the wire rules. Always connection-fatal
//!   because the byte stream can no longer be trusted.
//! - [`CodecError`]: wraps frame violations together with transport I/O
//!   failures and premature end of stream.

use std::io;

use thiserror::Error;

use super::{ErrorCode, FrameKind, StreamId};

/// Wire-rule violations detected while decoding or encoding a frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length field exceeds the negotiated maximum frame size.
    #[error("frame exceeds max size: {size} > {max}")]
    FrameTooLarge {
        /// Length announced by the header.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// A fixed-size frame carried the wrong number of payload bytes.
    #[error("invalid payload length for {kind:?}: {len}")]
    InvalidPayloadLength {
        /// Kind of the offending frame.
        kind: FrameKind,
        /// Payload length received.
        len: usize,
    },

    /// The frame targets the wrong scope (stream 0 vs. a stream).
    #[error("{kind:?} frame not permitted on stream {stream_id}")]
    InvalidStreamId {
        /// Kind of the offending frame.
        kind: FrameKind,
        /// Stream identifier received.
        stream_id: StreamId,
    },

    /// The pad length exceeds the payload.
    #[error("invalid padding on stream {stream_id}")]
    InvalidPadding {
        /// Stream identifier received.
        stream_id: StreamId,
    },
}

impl FrameError {
    /// Error code announced to the peer when this violation closes the connection.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::FrameTooLarge { .. } | Self::InvalidPayloadLength { .. } => {
                ErrorCode::FrameSizeError
            }
            Self::InvalidStreamId { .. } | Self::InvalidPadding { .. } => ErrorCode::ProtocolError,
        }
    }
}

/// Errors produced by [`FrameCodec`](super::FrameCodec).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Reading from or writing to the transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame violated the wire rules.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    /// The transport closed in the middle of a frame.
    #[error("transport closed mid-frame: {bytes_received} bytes buffered")]
    Eof {
        /// Bytes of the incomplete frame that were received.
        bytes_received: usize,
    },
}

impl CodecError {
    /// Returns `true` if the error is a transport failure rather than a
    /// protocol violation.
    #[must_use]
    pub fn is_transport(&self) -> bool { matches!(self, Self::Io(_) | Self::Eof { .. }) }
}
