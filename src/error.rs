//! Canonical error types for the connection engine.
//!
//! Faults are classified by blast radius:
//!
//! - [`ConnectionError`] is fatal. The multiplexer announces it with a final
//!   `GOAWAY` where the transport still allows it and then closes.
//! - [`StreamError`] is confined to one stream, which is reset while the
//!   connection keeps serving the others.
//!
//! Refused streams and drain timeouts are not errors at this level: a refused
//! stream is reset immediately and an elapsed drain deadline drives the
//! abortive shutdown path.

use std::io;

use thiserror::Error;

use crate::frame::{CodecError, ErrorCode, FrameError, StreamId};

/// Fatal connection-level failure.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer violated the protocol (malformed frame, stream-id ordering,
    /// connection-scope flow-control overflow and similar).
    #[error("protocol violation ({code}): {reason}")]
    Protocol {
        /// Code announced in the closing `GOAWAY`.
        code: ErrorCode,
        /// Human-readable description.
        reason: String,
    },

    /// Decoding the inbound byte stream failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Writing to or closing the transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// An application handler reported a protocol-level fault.
    #[error("handler fault on stream {stream_id}: {reason}")]
    Handler {
        /// Stream whose handler raised the fault.
        stream_id: StreamId,
        /// Description supplied by the handler.
        reason: String,
    },
}

impl ConnectionError {
    /// Construct a [`ConnectionError::Protocol`] with [`ErrorCode::ProtocolError`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::ProtocolError,
            reason: reason.into(),
        }
    }

    /// Construct a [`ConnectionError::Protocol`] with a specific code.
    pub fn with_code(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// Error code announced to the peer for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Codec(CodecError::Protocol(frame)) => frame.error_code(),
            Self::Handler { .. } => ErrorCode::ProtocolError,
            Self::Codec(_) | Self::Transport(_) => ErrorCode::InternalError,
        }
    }

    /// Returns `true` when the transport itself failed, so no closing frame
    /// can be delivered.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Codec(codec) => codec.is_transport(),
            Self::Protocol { .. } | Self::Handler { .. } => false,
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self { Self::Codec(CodecError::Protocol(err)) }
}

/// Stream-scoped failure; resets one stream only.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("stream {stream_id} reset: {code}")]
pub struct StreamError {
    /// Stream that is reset.
    pub stream_id: StreamId,
    /// Code carried by the `RST_STREAM` frame.
    pub code: ErrorCode,
}

impl StreamError {
    #[must_use]
    pub fn new(stream_id: StreamId, code: ErrorCode) -> Self { Self { stream_id, code } }
}

/// Result alias used by connection internals.
pub type Result<T> = std::result::Result<T, ConnectionError>;
