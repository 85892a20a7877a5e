//! Metric helpers for `muxframe`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "muxframe_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "muxframe_frames_processed_total";
/// Name of the counter tracking stream resets, sent or received.
pub const STREAM_RESETS: &str = "muxframe_stream_resets_total";
/// Name of the counter tracking connection closes by kind.
pub const SHUTDOWNS_TOTAL: &str = "muxframe_shutdowns_total";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Inbound frames received from the peer.
    Inbound,
    /// Outbound frames written to the peer.
    Outbound,
}

impl Direction {
    /// Label value used for this direction.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed frame for the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a stream reset.
pub fn inc_stream_resets() {
    #[cfg(feature = "metrics")]
    counter!(STREAM_RESETS).increment(1);
}

/// Record a connection close of the given kind.
pub fn inc_shutdowns(kind: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(SHUTDOWNS_TOTAL, "kind" => kind).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}
