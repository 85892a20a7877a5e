//! Internal event types for the connection select loop.

use crate::{
    frame::{CodecError, Frame},
    handler::StreamCommand,
};

/// Events returned by [`Connection::next_event`][super::Connection::next_event].
#[derive(Debug)]
pub(super) enum Event {
    /// Shutdown was requested through the handle.
    Shutdown,
    /// The drain deadline elapsed before the last stream finished.
    DrainElapsed,
    /// No streams remain while draining.
    Idle,
    /// A handler task produced output or finished.
    Command(StreamCommand),
    /// A frame arrived, decoding failed, or the peer closed its side.
    Inbound(Option<Result<Frame, CodecError>>),
}
