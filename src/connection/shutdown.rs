//! Shutdown control: the external handle, graceful draining and teardown.
//!
//! Shutdown runs in two phases. [`ConnectionHandle::request_shutdown`] moves a
//! running connection into draining: new streams are refused, a `GOAWAY`
//! naming the last accepted stream is sent, and a grace timer starts. When
//! the last stream finishes the connection closes gracefully; when the timer
//! fires first every remaining stream is reset with `CANCEL` and the
//! connection closes abortively.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::SinkExt;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

use super::{
    Connection,
    outbound::queued_streams,
    state::{CloseKind, ConnectionReport, ConnectionState},
};
use crate::{
    config::FinalGoAway,
    error::ConnectionError,
    frame::{ErrorCode, Frame, StreamId},
    handler::{StreamHandler, StreamOutcome},
    metrics,
    registry::StreamRegistry,
};

#[derive(Debug)]
pub(crate) struct HandleInner {
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    report: watch::Sender<Option<ConnectionReport>>,
    registry: Arc<StreamRegistry>,
}

/// Cloneable control handle for a running [`Connection`].
///
/// The handle outlives the connection task; once the connection has closed
/// its [`ConnectionReport`] stays available through [`closed`](Self::closed).
#[derive(Clone, Debug)]
pub struct ConnectionHandle(Arc<HandleInner>);

impl ConnectionHandle {
    pub(super) fn new(registry: Arc<StreamRegistry>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Running);
        let (report, _) = watch::channel(None);
        Self(Arc::new(HandleInner {
            shutdown: CancellationToken::new(),
            state,
            report,
            registry,
        }))
    }

    /// Ask the connection to drain. Returns immediately; repeated calls have
    /// no further effect.
    pub fn request_shutdown(&self) { self.0.shutdown.cancel(); }

    /// Request shutdown and wait for the connection to close.
    ///
    /// Idempotent: every caller receives the same report.
    pub async fn shutdown(&self) -> ConnectionReport {
        self.request_shutdown();
        self.closed().await
    }

    /// Wait until the connection has closed, without requesting shutdown.
    pub async fn closed(&self) -> ConnectionReport {
        let mut rx = self.0.report.subscribe();
        loop {
            if let Some(report) = rx.borrow_and_update().clone() {
                return report;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `HandleInner`, which `self` keeps alive.
                return ConnectionReport::new(CloseKind::Abortive);
            }
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState { *self.0.state.borrow() }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> { self.0.state.subscribe() }

    /// Number of streams currently open.
    #[must_use]
    pub fn open_streams(&self) -> usize { self.0.registry.open_count() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.state().is_closed() }

    pub(super) fn token(&self) -> &CancellationToken { &self.0.shutdown }

    pub(super) fn publish_state(&self, state: ConnectionState) {
        self.0.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Publish the final report. Only the first report is kept.
    pub(super) fn publish_report(&self, report: ConnectionReport) -> bool {
        self.0.report.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(report);
            true
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> { Arc::downgrade(&self.0) }

    pub(crate) fn from_arc(inner: Arc<HandleInner>) -> Self { Self(inner) }
}

impl<T, H> Connection<T, H>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    H: StreamHandler,
{
    /// Enter the graceful phase. Does nothing unless the connection is running.
    pub(super) fn begin_drain(&mut self) {
        if !self.state.is_running() {
            return;
        }
        self.state = ConnectionState::GracefulDraining;
        self.handle.publish_state(self.state);
        let boundary = self.last_peer_stream;
        self.registry.begin_draining(boundary);
        self.goaway_boundary = Some(boundary);
        self.queue_control(Frame::go_away(boundary, ErrorCode::NoError, Bytes::new()));
        let now = Instant::now();
        let deadline = now
            .checked_add(self.config.grace_period)
            .unwrap_or_else(|| now + std::time::Duration::from_secs(86_400 * 365));
        self.drain_deadline = Some(deadline);
        info!(
            "connection draining: connection_id={:?}, peer_addr={:?}, last_stream_id={boundary}, \
             open_streams={}, grace_period={:?}",
            self.connection_id,
            self.peer_addr,
            self.registry.open_count(),
            self.config.grace_period
        );
    }

    /// Log what is left when the grace period runs out.
    pub(super) fn log_drain_elapsed(&self) {
        warn!(
            "grace period elapsed: connection_id={:?}, open_streams={}, queued_streams={}, \
             grace_period={:?}",
            self.connection_id,
            self.registry.open_count(),
            queued_streams(&self.streams),
            self.config.grace_period
        );
    }

    /// Close the connection and produce its report.
    ///
    /// `error` is set when the connection failed; transport failures skip
    /// the final `GOAWAY`.
    pub(super) async fn teardown(
        &mut self,
        close: CloseKind,
        error: Option<&ConnectionError>,
    ) -> ConnectionReport {
        self.registry.close();
        let unfinished = self.take_opening_block();
        let last = self.goaway_boundary.unwrap_or(self.last_peer_stream);
        match close {
            CloseKind::Graceful => {}
            CloseKind::Abortive => {
                for id in self.registry.open_ids() {
                    self.reset_stream(id, ErrorCode::Cancel, StreamOutcome::Aborted);
                }
                if let Some(id) = unfinished {
                    self.queue_bare_reset(id, ErrorCode::Cancel);
                    self.report.aborted_streams.push(id);
                }
                if self.config.abortive_goaway == FinalGoAway::Send {
                    self.queue_control(Frame::go_away(last, ErrorCode::Cancel, Bytes::new()));
                }
            }
            CloseKind::Error => {
                self.streams_cancel.cancel();
                self.outbox.clear();
                if error.is_none_or(|err| !err.is_transport()) {
                    let (code, reason) = match error {
                        Some(err) => (err.code(), err.to_string()),
                        None => (ErrorCode::InternalError, String::new()),
                    };
                    self.queue_control(Frame::go_away(
                        self.last_peer_stream,
                        code,
                        Bytes::from(reason),
                    ));
                }
            }
        }

        let budget = self.config.teardown_timeout;
        let flushed = timeout(budget, self.close_transport()).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("transport close failed: error={err}"),
            Err(_) => warn!("transport close timed out: timeout={budget:?}"),
        }

        self.streams_cancel.cancel();
        self.tasks.close();
        if timeout(budget, self.tasks.wait()).await.is_err() {
            warn!(
                "stream tasks still running after teardown: tasks={}",
                self.tasks.len()
            );
        }

        let leftover: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in leftover {
            self.retire(id, StreamOutcome::Aborted);
        }

        let mut report = std::mem::replace(&mut self.report, ConnectionReport::new(close));
        report.close = close;
        report.aborted_streams.sort_unstable();
        report.error = error.map(ConnectionError::code);
        self.state = ConnectionState::Closed(close);
        self.handle.publish_state(self.state);
        self.handle.publish_report(report.clone());
        metrics::inc_shutdowns(close.as_str());
        info!(
            "connection closed: connection_id={:?}, peer_addr={:?}, close={close}, \
             completed_streams={}, reset_streams={}, aborted_streams={:?}",
            self.connection_id,
            self.peer_addr,
            report.completed_streams,
            report.reset_streams,
            report.aborted_streams
        );
        report
    }

    async fn close_transport(&mut self) -> Result<(), ConnectionError> {
        self.write_outbox().await?;
        self.writer.flush().await?;
        self.writer.get_mut().shutdown().await?;
        Ok(())
    }
}
