//! Connection- and stream-level flow-control accounting.
//!
//! [`FlowController`] tracks send credit granted by the peer and receive
//! credit granted to the peer. Credit is held in [`Window`] values that never
//! go negative: a settings change that would shrink a window below zero is
//! recorded as debt and absorbs later grants instead.
//!
//! Sending is a two-step affair. The multiplexer calls
//! [`FlowController::reserve`] before framing payload bytes and receives at
//! most the credit currently available; it never waits. Reservations that are
//! not emitted (for example because the stream was reset first) are returned
//! with [`FlowController::release`].

use std::{collections::HashMap, fmt};

use thiserror::Error;

use crate::frame::StreamId;

/// Largest legal window size (`2^31 - 1`).
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;
/// Initial window size before settings are exchanged.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Target of a flow-control operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowScope {
    Connection,
    Stream(StreamId),
}

impl fmt::Display for FlowScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Stream(id) => write!(f, "stream {id}"),
        }
    }
}

/// Flow-control violations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FlowControlError {
    /// A grant would push the window past [`MAX_WINDOW_SIZE`].
    #[error("window overflow on {scope}: {available} + {delta} exceeds {MAX_WINDOW_SIZE}")]
    Overflow {
        scope: FlowScope,
        available: u32,
        delta: u32,
    },
    /// A grant carried a zero increment.
    #[error("zero window increment on {scope}")]
    ZeroIncrement { scope: FlowScope },
    /// The peer sent more payload than the receive window allows.
    #[error("receive window exceeded on {scope}: {len} > {available}")]
    ReceiveWindowExceeded {
        scope: FlowScope,
        len: u32,
        available: u32,
    },
}

impl FlowControlError {
    /// Scope whose accounting was violated.
    #[must_use]
    pub fn scope(&self) -> FlowScope {
        match self {
            Self::Overflow { scope, .. }
            | Self::ZeroIncrement { scope }
            | Self::ReceiveWindowExceeded { scope, .. } => *scope,
        }
    }
}

/// A credit balance that never goes negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    credit: u32,
    debt: u32,
}

impl Window {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            credit: initial,
            debt: 0,
        }
    }

    /// Credit that may be consumed right now.
    #[must_use]
    pub fn available(&self) -> u32 { self.credit }

    /// Add credit, first paying down any debt.
    fn grant(&mut self, delta: u32) -> Result<(), u32> {
        let effective = i64::from(self.credit) - i64::from(self.debt);
        if effective + i64::from(delta) > i64::from(MAX_WINDOW_SIZE) {
            return Err(self.credit);
        }
        if delta >= self.debt {
            self.credit += delta - self.debt;
            self.debt = 0;
        } else {
            self.debt -= delta;
        }
        Ok(())
    }

    /// Remove credit; whatever exceeds the balance becomes debt.
    fn shrink(&mut self, delta: u32) {
        if delta <= self.credit {
            self.credit -= delta;
        } else {
            self.debt = self.debt.saturating_add(delta - self.credit);
            self.credit = 0;
        }
    }

    /// Consume up to `amount`, returning the amount actually taken.
    fn take(&mut self, amount: u32) -> u32 {
        let taken = amount.min(self.credit);
        self.credit -= taken;
        taken
    }
}

#[derive(Clone, Copy, Debug)]
struct StreamWindows {
    send: Window,
    recv: Window,
    /// Received bytes consumed by the application but not yet re-granted.
    recv_unacked: u32,
}

/// Window updates the multiplexer should announce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowUpdates {
    pub connection: Option<u32>,
    pub stream: Option<u32>,
}

/// Per-connection flow-control manager.
#[derive(Debug)]
pub struct FlowController {
    conn_send: Window,
    conn_recv: Window,
    conn_recv_unacked: u32,
    conn_recv_target: u32,
    initial_send: u32,
    initial_recv: u32,
    streams: HashMap<StreamId, StreamWindows>,
}

impl FlowController {
    /// Create a controller.
    ///
    /// `initial_recv` is the stream window advertised to the peer and
    /// `connection_recv` the connection receive window. Send windows start
    /// at [`DEFAULT_WINDOW_SIZE`] until the peer's settings say otherwise.
    #[must_use]
    pub fn new(initial_recv: u32, connection_recv: u32) -> Self {
        Self {
            conn_send: Window::new(DEFAULT_WINDOW_SIZE),
            // The connection receive window always starts at the protocol
            // default; any larger target is announced with a WINDOW_UPDATE.
            conn_recv: Window::new(DEFAULT_WINDOW_SIZE.min(connection_recv)),
            conn_recv_unacked: 0,
            conn_recv_target: connection_recv,
            initial_send: DEFAULT_WINDOW_SIZE,
            initial_recv,
            streams: HashMap::new(),
        }
    }

    /// Increment needed to raise the connection receive window from the
    /// protocol default to the configured target, if any.
    #[must_use]
    pub fn initial_connection_update(&mut self) -> Option<u32> {
        let current = self.conn_recv.available();
        let delta = self.conn_recv_target.checked_sub(current).filter(|d| *d > 0)?;
        self.conn_recv.grant(delta).ok()?;
        Some(delta)
    }

    /// Start tracking `id` with the current initial windows.
    pub fn open_stream(&mut self, id: StreamId) {
        self.streams.insert(
            id,
            StreamWindows {
                send: Window::new(self.initial_send),
                recv: Window::new(self.initial_recv),
                recv_unacked: 0,
            },
        );
    }

    /// Stop tracking `id`.
    pub fn close_stream(&mut self, id: StreamId) { self.streams.remove(&id); }

    /// Send credit available for `scope`.
    ///
    /// For a stream this is bounded by the connection window as well.
    #[must_use]
    pub fn available(&self, scope: FlowScope) -> u32 {
        match scope {
            FlowScope::Connection => self.conn_send.available(),
            FlowScope::Stream(id) => self
                .streams
                .get(&id)
                .map_or(0, |s| s.send.available().min(self.conn_send.available())),
        }
    }

    /// Apply a `WINDOW_UPDATE` from the peer.
    ///
    /// Grants for untracked streams are ignored, since the peer may race a
    /// stream's closure.
    ///
    /// # Errors
    ///
    /// Returns [`FlowControlError::ZeroIncrement`] for a zero delta and
    /// [`FlowControlError::Overflow`] if the window would exceed
    /// [`MAX_WINDOW_SIZE`].
    pub fn grant(&mut self, scope: FlowScope, delta: u32) -> Result<(), FlowControlError> {
        if delta == 0 {
            return Err(FlowControlError::ZeroIncrement { scope });
        }
        let window = match scope {
            FlowScope::Connection => &mut self.conn_send,
            FlowScope::Stream(id) => match self.streams.get_mut(&id) {
                Some(s) => &mut s.send,
                None => return Ok(()),
            },
        };
        window
            .grant(delta)
            .map_err(|available| FlowControlError::Overflow {
                scope,
                available,
                delta,
            })
    }

    /// Reserve up to `amount` bytes of send credit for `scope`.
    ///
    /// A stream reservation also draws on the connection window, so the
    /// connection window bounds the sum of in-flight stream reservations.
    /// Returns the credit reserved, which may be zero.
    pub fn reserve(&mut self, scope: FlowScope, amount: u32) -> u32 {
        let granted = amount.min(self.available(scope));
        if granted == 0 {
            return 0;
        }
        if let FlowScope::Stream(id) = scope
            && let Some(stream) = self.streams.get_mut(&id)
        {
            stream.send.take(granted);
        }
        self.conn_send.take(granted)
    }

    /// Return reserved credit that was never emitted.
    ///
    /// Credit for streams that are no longer tracked is returned to the
    /// connection window only.
    pub fn release(&mut self, scope: FlowScope, amount: u32) {
        if amount == 0 {
            return;
        }
        if let FlowScope::Stream(id) = scope
            && let Some(stream) = self.streams.get_mut(&id)
        {
            let _ = stream.send.grant(amount);
        }
        let _ = self.conn_send.grant(amount);
    }

    /// Apply a new peer `INITIAL_WINDOW_SIZE` to every tracked stream.
    ///
    /// # Errors
    ///
    /// Returns [`FlowControlError::Overflow`] if the increase would push a
    /// stream window past [`MAX_WINDOW_SIZE`].
    pub fn set_initial_send_window(&mut self, size: u32) -> Result<(), FlowControlError> {
        let old = self.initial_send;
        self.initial_send = size;
        for (id, stream) in &mut self.streams {
            if size >= old {
                let delta = size - old;
                if delta > 0 {
                    stream
                        .send
                        .grant(delta)
                        .map_err(|available| FlowControlError::Overflow {
                            scope: FlowScope::Stream(*id),
                            available,
                            delta,
                        })?;
                }
            } else {
                stream.send.shrink(old - size);
            }
        }
        Ok(())
    }

    /// Account for `len` received payload bytes.
    ///
    /// The connection window is charged first so a stream-level violation
    /// still consumes connection credit.
    ///
    /// # Errors
    ///
    /// Returns [`FlowControlError::ReceiveWindowExceeded`] scoped to the
    /// connection or the stream that overflowed.
    pub fn receive(&mut self, stream: Option<StreamId>, len: u32) -> Result<(), FlowControlError> {
        let available = self.conn_recv.available();
        if len > available {
            return Err(FlowControlError::ReceiveWindowExceeded {
                scope: FlowScope::Connection,
                len,
                available,
            });
        }
        self.conn_recv.take(len);
        if let Some(id) = stream
            && let Some(windows) = self.streams.get_mut(&id)
        {
            let available = windows.recv.available();
            if len > available {
                return Err(FlowControlError::ReceiveWindowExceeded {
                    scope: FlowScope::Stream(id),
                    len,
                    available,
                });
            }
            windows.recv.take(len);
        }
        Ok(())
    }

    /// Record that `len` received bytes were consumed (or discarded) and
    /// compute the window updates to announce.
    ///
    /// Credit is returned in batches once half of the initial window has been
    /// consumed, matching the usual low-watermark strategy.
    pub fn consume(&mut self, stream: Option<StreamId>, len: u32) -> WindowUpdates {
        let mut updates = WindowUpdates::default();
        self.conn_recv_unacked = self.conn_recv_unacked.saturating_add(len);
        if self.conn_recv_unacked >= self.conn_recv_target / 2 {
            let delta = self.conn_recv_unacked;
            if self.conn_recv.grant(delta).is_ok() {
                self.conn_recv_unacked = 0;
                updates.connection = Some(delta);
            }
        }
        let threshold = self.initial_recv / 2;
        if let Some(id) = stream
            && let Some(windows) = self.streams.get_mut(&id)
        {
            windows.recv_unacked = windows.recv_unacked.saturating_add(len);
            if windows.recv_unacked >= threshold && windows.recv_unacked > 0 {
                let delta = windows.recv_unacked;
                if windows.recv.grant(delta).is_ok() {
                    windows.recv_unacked = 0;
                    updates.stream = Some(delta);
                }
            }
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    const S1: StreamId = StreamId::new(1);
    const S3: StreamId = StreamId::new(3);

    #[fixture]
    fn flow() -> FlowController {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.open_stream(S1);
        flow.open_stream(S3);
        flow
    }

    #[rstest]
    fn reserve_is_bounded_by_stream_and_connection(mut flow: FlowController) {
        assert_eq!(flow.reserve(FlowScope::Stream(S1), 70_000), DEFAULT_WINDOW_SIZE);
        assert_eq!(flow.available(FlowScope::Connection), 0);
        assert_eq!(flow.reserve(FlowScope::Stream(S3), 10), 0);
    }

    #[rstest]
    fn release_restores_credit(mut flow: FlowController) {
        let reserved = flow.reserve(FlowScope::Stream(S1), 1000);
        flow.release(FlowScope::Stream(S1), reserved);
        assert_eq!(flow.available(FlowScope::Stream(S1)), DEFAULT_WINDOW_SIZE);
        assert_eq!(flow.available(FlowScope::Connection), DEFAULT_WINDOW_SIZE);
    }

    #[rstest]
    fn grant_overflow_is_rejected(mut flow: FlowController) {
        let err = flow
            .grant(FlowScope::Connection, MAX_WINDOW_SIZE)
            .expect_err("overflow");
        assert_eq!(err.scope(), FlowScope::Connection);
        assert_eq!(flow.available(FlowScope::Connection), DEFAULT_WINDOW_SIZE);
    }

    #[rstest]
    fn zero_increment_is_rejected(mut flow: FlowController) {
        assert_eq!(
            flow.grant(FlowScope::Stream(S1), 0),
            Err(FlowControlError::ZeroIncrement {
                scope: FlowScope::Stream(S1)
            })
        );
    }

    #[rstest]
    fn grant_for_unknown_stream_is_ignored(mut flow: FlowController) {
        assert_eq!(flow.grant(FlowScope::Stream(StreamId::new(99)), 10), Ok(()));
    }

    #[rstest]
    fn shrinking_settings_create_debt_not_negative_windows(mut flow: FlowController) {
        flow.reserve(FlowScope::Stream(S1), 60_000);
        flow.set_initial_send_window(1_000).expect("shrink");
        assert_eq!(flow.available(FlowScope::Stream(S1)), 0);
        // 5_535 left, minus 64_535 shrink: 59_000 of debt to pay down.
        flow.grant(FlowScope::Stream(S1), 59_000).expect("grant");
        assert_eq!(flow.available(FlowScope::Stream(S1)), 0);
        flow.grant(FlowScope::Stream(S1), 10).expect("grant");
        assert_eq!(flow.available(FlowScope::Stream(S1)), 10);
    }

    #[rstest]
    fn receive_overflow_is_scoped(mut flow: FlowController) {
        let err = flow
            .receive(Some(S1), DEFAULT_WINDOW_SIZE + 1)
            .expect_err("connection overflow");
        assert_eq!(err.scope(), FlowScope::Connection);

        let mut flow = FlowController::new(100, DEFAULT_WINDOW_SIZE);
        flow.open_stream(S1);
        let err = flow.receive(Some(S1), 101).expect_err("stream overflow");
        assert_eq!(err.scope(), FlowScope::Stream(S1));
    }

    #[rstest]
    fn consume_returns_credit_past_half_window(mut flow: FlowController) {
        flow.receive(Some(S1), 40_000).expect("receive");
        let updates = flow.consume(Some(S1), 20_000);
        assert_eq!(updates, WindowUpdates::default());
        let updates = flow.consume(Some(S1), 20_000);
        assert_eq!(updates.connection, Some(40_000));
        assert_eq!(updates.stream, Some(40_000));
    }

    #[test]
    fn larger_connection_window_is_announced_once() {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, 1 << 20);
        assert_eq!(
            flow.initial_connection_update(),
            Some((1 << 20) - DEFAULT_WINDOW_SIZE)
        );
        assert_eq!(flow.initial_connection_update(), None);
    }
}
