//! Connection lifecycle state and the shutdown report.

use std::fmt;

use crate::frame::{ErrorCode, StreamId};

/// How a connection reached `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseKind {
    /// Every stream finished and its response was flushed.
    Graceful,
    /// The drain deadline elapsed and remaining streams were reset.
    Abortive,
    /// A connection-fatal error (protocol or transport) ended the connection.
    Error,
}

impl CloseKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Graceful => "graceful",
            Self::Abortive => "abortive",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CloseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Observable lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Running,
    /// New streams are refused while existing ones finish.
    GracefulDraining,
    Closed(CloseKind),
}

impl ConnectionState {
    #[must_use]
    pub fn is_running(self) -> bool { matches!(self, Self::Running) }

    #[must_use]
    pub fn is_draining(self) -> bool { matches!(self, Self::GracefulDraining) }

    #[must_use]
    pub fn is_closed(self) -> bool { matches!(self, Self::Closed(_)) }
}

/// Outcome reported once a connection has closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionReport {
    pub close: CloseKind,
    /// Streams still open when the connection was torn down, in ascending order.
    pub aborted_streams: Vec<StreamId>,
    /// Streams whose handlers finished and whose responses were fully written.
    pub completed_streams: usize,
    /// Streams reset by either side before completing.
    pub reset_streams: usize,
    /// Code announced to the peer when the connection failed.
    pub error: Option<ErrorCode>,
}

impl ConnectionReport {
    pub(crate) fn new(close: CloseKind) -> Self {
        Self {
            close,
            aborted_streams: Vec::new(),
            completed_streams: 0,
            reset_streams: 0,
            error: None,
        }
    }

    /// Returns `true` if `id` was aborted.
    #[must_use]
    pub fn was_aborted(&self, id: StreamId) -> bool { self.aborted_streams.contains(&id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::default().is_running());
        assert!(ConnectionState::GracefulDraining.is_draining());
        assert!(ConnectionState::Closed(CloseKind::Abortive).is_closed());
    }

    #[test]
    fn report_tracks_aborted_ids() {
        let mut report = ConnectionReport::new(CloseKind::Abortive);
        report.aborted_streams.push(StreamId::new(3));
        assert!(report.was_aborted(StreamId::new(3)));
        assert!(!report.was_aborted(StreamId::new(1)));
        assert_eq!(report.close.to_string(), "abortive");
    }
}
