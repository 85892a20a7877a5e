//! Connection multiplexer and shutdown coordinator.
//!
//! A [`Connection`] owns one transport. Its task reads frames, routes them
//! to per-stream handler tasks, and writes handler output back through a
//! single writer under flow control. All per-connection state lives inside
//! the task; handlers talk to it over a command channel and outside callers
//! control it through a [`ConnectionHandle`].
//!
//! The task is a biased `tokio::select!` loop. Shutdown requests are polled
//! first, then the drain timer and the idle notification, then handler
//! commands, and inbound frames last.

mod counter;
mod event;
mod inbound;
mod outbound;
mod shutdown;
mod state;

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

pub use counter::active_connection_count;
use counter::LiveConnection;
use event::Event;
use futures::StreamExt;
use leaky_bucket::RateLimiter;
use log::{debug, error, info, warn};
use outbound::{Outgoing, StreamSlot};
pub(crate) use shutdown::HandleInner;
pub use shutdown::ConnectionHandle;
pub use state::{CloseKind, ConnectionReport, ConnectionState};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::mpsc,
    time::{Instant, sleep_until, timeout_at},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    config::{ConfigError, ConnectionConfig},
    error::Result,
    fairness::FairScheduler,
    flow::FlowController,
    frame::{Frame, FrameCodec, StreamId},
    handler::{StreamCommand, StreamHandler},
    registry::StreamRegistry,
    session::ConnectionId,
};

/// Multiplexed connection over one transport.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use muxframe::{
///     config::ConnectionConfig,
///     connection::Connection,
///     handler::{Request, ResponseWriter, handler_fn},
/// };
///
/// # async fn demo(socket: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
/// let handler = handler_fn(|_req: Request, mut res: ResponseWriter| async move {
///     res.send_headers(bytes::Bytes::from_static(b"ok"), true)?;
///     Ok(())
/// });
/// let conn = Connection::new(socket, Arc::new(handler), ConnectionConfig::default())?;
/// let handle = conn.handle();
/// let task = tokio::spawn(conn.run());
/// let report = handle.shutdown().await;
/// println!("closed: {}", report.close);
/// # let _ = task.await;
/// # Ok(())
/// # }
/// ```
pub struct Connection<T, H> {
    reader: FramedRead<ReadHalf<T>, FrameCodec>,
    writer: FramedWrite<WriteHalf<T>, FrameCodec>,
    config: ConnectionConfig,
    handler: Arc<H>,
    registry: Arc<StreamRegistry>,
    flow: FlowController,
    streams: HashMap<StreamId, StreamSlot>,
    scheduler: FairScheduler,
    outbox: VecDeque<Outgoing>,
    header_block: Option<inbound::HeaderBlock>,
    commands_tx: mpsc::UnboundedSender<StreamCommand>,
    commands_rx: mpsc::UnboundedReceiver<StreamCommand>,
    handle: ConnectionHandle,
    state: ConnectionState,
    drain_deadline: Option<Instant>,
    /// Cleared once the peer has closed its side.
    reading: bool,
    last_peer_stream: StreamId,
    /// Recently admitted peer stream ids, oldest first.
    opened: VecDeque<StreamId>,
    /// Last stream id announced in our `GOAWAY`.
    goaway_boundary: Option<StreamId>,
    peer_max_frame_size: usize,
    control_limiter: RateLimiter,
    tasks: TaskTracker,
    /// Parent of every stream's cancellation token.
    streams_cancel: CancellationToken,
    report: ConnectionReport,
    connection_id: Option<ConnectionId>,
    peer_addr: Option<SocketAddr>,
    _live: LiveConnection,
}

impl<T, H> Connection<T, H>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    H: StreamHandler,
{
    /// Wrap `transport` in a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(
        transport: T,
        handler: Arc<H>,
        config: ConnectionConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (read_half, write_half) = tokio::io::split(transport);
        let registry = Arc::new(StreamRegistry::new(config.max_concurrent_streams));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let peer_max_frame_size = FrameCodec::default().max_frame_size();
        let control_rate = config.control_frame_rate;
        Ok(Self {
            reader: FramedRead::new(read_half, FrameCodec::new(config.max_frame_size)),
            writer: FramedWrite::new(write_half, FrameCodec::default()),
            flow: FlowController::new(config.initial_window_size, config.connection_window_size),
            handle: ConnectionHandle::new(Arc::clone(&registry)),
            registry,
            handler,
            streams: HashMap::new(),
            scheduler: FairScheduler::new(peer_max_frame_size),
            outbox: VecDeque::new(),
            header_block: None,
            commands_tx,
            commands_rx,
            state: ConnectionState::Running,
            drain_deadline: None,
            reading: true,
            last_peer_stream: StreamId::ZERO,
            opened: VecDeque::new(),
            goaway_boundary: None,
            peer_max_frame_size,
            control_limiter: RateLimiter::builder()
                .initial(control_rate)
                .refill(control_rate)
                .interval(Duration::from_secs(1))
                .max(control_rate)
                .build(),
            tasks: TaskTracker::new(),
            streams_cancel: CancellationToken::new(),
            report: ConnectionReport::new(CloseKind::Graceful),
            connection_id: None,
            peer_addr: None,
            config,
            _live: LiveConnection::new(),
        })
    }

    /// Tag log output with a connection identifier.
    #[must_use]
    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Tag log output with the peer's address.
    #[must_use]
    pub fn with_peer_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.peer_addr = addr;
        self
    }

    /// Handle for requesting shutdown and observing the connection.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle { self.handle.clone() }

    /// Drive the connection until it closes.
    ///
    /// Returns the report of a graceful or abortive close. The same report
    /// is published to every [`ConnectionHandle`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`](crate::error::ConnectionError) when the peer violates the protocol or the
    /// transport fails. A closing `GOAWAY` is sent first when the transport
    /// still allows it.
    pub async fn run(mut self) -> Result<ConnectionReport> {
        info!(
            "connection opened: connection_id={:?}, peer_addr={:?}, active_connections={}",
            self.connection_id,
            self.peer_addr,
            active_connection_count()
        );
        match self.serve().await {
            Ok(close) => Ok(self.teardown(close, None).await),
            Err(err) => {
                if err.is_transport() {
                    warn!(
                        "connection transport failed: connection_id={:?}, peer_addr={:?}, error={err}",
                        self.connection_id, self.peer_addr
                    );
                } else {
                    error!(
                        "connection failed: connection_id={:?}, peer_addr={:?}, code={}, error={err}",
                        self.connection_id,
                        self.peer_addr,
                        err.code()
                    );
                }
                self.teardown(CloseKind::Error, Some(&err)).await;
                Err(err)
            }
        }
    }

    async fn serve(&mut self) -> Result<CloseKind> {
        self.queue_control(Frame::settings(&self.config.local_settings()));
        if let Some(increment) = self.flow.initial_connection_update() {
            self.queue_control(Frame::window_update(StreamId::ZERO, increment));
        }
        loop {
            self.flush_bounded().await?;
            if self.state.is_draining()
                && self.registry.open_count() == 0
                && !self.opening_stream()
                && self.outbox.is_empty()
            {
                return Ok(CloseKind::Graceful);
            }
            if self.drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.log_drain_elapsed();
                return Ok(CloseKind::Abortive);
            }
            match self.next_event().await {
                Event::Shutdown => self.begin_drain(),
                Event::DrainElapsed | Event::Idle => {}
                Event::Command(command) => self.on_command(command)?,
                Event::Inbound(Some(Ok(frame))) => self.handle_frame(frame)?,
                Event::Inbound(Some(Err(err))) => return Err(err.into()),
                Event::Inbound(None) => {
                    debug!(
                        "peer closed its side: connection_id={:?}, open_streams={}",
                        self.connection_id,
                        self.registry.open_count()
                    );
                    self.reading = false;
                    if self.header_block.take().is_some() {
                        debug!("dropping unfinished header block at end of input");
                    }
                    self.begin_drain();
                }
            }
        }
    }

    /// Flush pending output without outliving the current phase.
    ///
    /// While running, a shutdown request interrupts the flush; while
    /// draining, the drain deadline does. Frames not yet accepted by the
    /// sink stay in the outbox.
    async fn flush_bounded(&mut self) -> Result<()> {
        if let Some(deadline) = self.drain_deadline {
            return match timeout_at(deadline, self.flush_pending()).await {
                Ok(flushed) => flushed,
                Err(_) => Ok(()),
            };
        }
        let shutdown = self.handle.token().clone();
        let running = self.state.is_running();
        tokio::select! {
            biased;
            flushed = self.flush_pending() => flushed,
            () = shutdown.cancelled(), if running => Ok(()),
        }
    }

    async fn next_event(&mut self) -> Event {
        let running = self.state.is_running();
        let draining = self.state.is_draining() && !self.opening_stream();
        let deadline = self.drain_deadline;
        let reading = self.reading;
        tokio::select! {
            biased;
            () = self.handle.token().cancelled(), if running => Event::Shutdown,
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Event::DrainElapsed
            }
            () = self.registry.wait_idle(), if draining => Event::Idle,
            Some(command) = self.commands_rx.recv() => Event::Command(command),
            inbound = self.reader.next(), if reading => Event::Inbound(inbound),
        }
    }
}

impl<T, H> Drop for Connection<T, H> {
    fn drop(&mut self) {
        self.streams_cancel.cancel();
        if !self.state.is_closed() {
            // The task was dropped before teardown ran.
            self.handle
                .publish_state(ConnectionState::Closed(CloseKind::Abortive));
            let mut report = ConnectionReport::new(CloseKind::Abortive);
            report.aborted_streams = self.registry.open_ids();
            self.handle.publish_report(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use rstest::rstest;
    use tokio::io::duplex;
    use tokio_util::codec::Framed;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        frame::{ErrorCode, Frame, FrameKind},
        handler::{Request, ResponseWriter, handler_fn},
    };

    fn ok_handler() -> Arc<impl StreamHandler> {
        Arc::new(handler_fn(|_req: Request, mut res: ResponseWriter| async move {
            res.send_headers(Bytes::from_static(b"ok"), true)?;
            Ok(())
        }))
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_invalid_config() {
        let (_client, server) = duplex(64);
        let config = ConnectionConfig::default().with_max_concurrent_streams(0);
        assert!(matches!(
            Connection::new(server, ok_handler(), config),
            Err(ConfigError::ZeroConcurrency)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn idle_connection_closes_gracefully_on_request() {
        let (_client, server) = duplex(1024);
        let conn = Connection::new(server, ok_handler(), ConnectionConfig::default())
            .expect("valid config");
        let handle = conn.handle();
        let task = tokio::spawn(conn.run());
        let report = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown completes");
        assert_eq!(report.close, CloseKind::Graceful);
        assert!(report.aborted_streams.is_empty());
        let ran = task.await.expect("task joins").expect("run succeeds");
        assert_eq!(ran, report);
        assert!(handle.is_closed());
    }

    /// Panicking handlers reset their stream and are reported through `tracing`.
    #[rstest]
    #[traced_test]
    #[tokio::test]
    async fn handler_panic_resets_stream_and_is_traced() {
        let handler = Arc::new(handler_fn(|req: Request, _res: ResponseWriter| async move {
            assert!(req.stream_id().is_zero(), "boom");
            Ok(())
        }));
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::new(server, handler, ConnectionConfig::default())
            .expect("valid config");
        let handle = conn.handle();
        let task = tokio::spawn(conn.run());
        let mut peer = Framed::new(client, FrameCodec::default());
        peer.send(Frame::headers(
            StreamId::new(1),
            Bytes::from_static(b"GET /"),
            true,
            true,
        ))
        .await
        .expect("send headers");

        let reset = loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
                .await
                .expect("frame before timeout")
                .expect("connection open")
                .expect("valid frame");
            if frame.kind() == FrameKind::RstStream {
                break frame;
            }
        };
        assert_eq!(reset.reset_code().ok(), Some(ErrorCode::InternalError));
        let report = handle.shutdown().await;
        assert_eq!(report.reset_streams, 1);
        task.await.expect("task joins").expect("run succeeds");
        assert!(logs_contain("stream handler panicked"));
        assert!(logs_contain("boom"));
    }

    #[rstest]
    #[tokio::test]
    async fn dropping_the_task_publishes_an_abortive_report() {
        let (_client, server) = duplex(1024);
        let conn = Connection::new(server, ok_handler(), ConnectionConfig::default())
            .expect("valid config");
        let handle = conn.handle();
        drop(conn);
        let report = handle.closed().await;
        assert_eq!(report.close, CloseKind::Abortive);
        assert_eq!(handle.state(), ConnectionState::Closed(CloseKind::Abortive));
    }
}
