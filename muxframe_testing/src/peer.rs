//! In-memory client peer speaking the frame codec.
//!
//! [`TestPeer`] sits on one end of a `tokio::io::duplex` pipe while a
//! [`Connection`] runs on the other, so tests can drive the multiplexer
//! frame by frame without sockets.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use muxframe::{
    config::ConnectionConfig,
    connection::{Connection, ConnectionHandle, ConnectionReport},
    error::ConnectionError,
    frame::{CodecError, ErrorCode, Frame, FrameCodec, FrameKind, Setting, StreamId},
    handler::StreamHandler,
};
use tokio::{
    io::{DuplexStream, duplex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;

/// How long [`TestPeer::recv`] waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the in-memory pipe used by [`spawn_connection`].
pub const PIPE_CAPACITY: usize = 256 * 1024;

/// Client side of an in-memory connection.
pub struct TestPeer {
    framed: Framed<DuplexStream, FrameCodec>,
    /// Frames read while looking for something else.
    stash: VecDeque<Frame>,
}

impl TestPeer {
    /// Wrap the client end of a duplex pipe.
    #[must_use]
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
            stash: VecDeque::new(),
        }
    }

    /// Write one frame, panicking if the pipe is closed.
    pub async fn send(&mut self, frame: Frame) {
        self.try_send(frame).await.expect("send frame to connection");
    }

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns the codec error when the pipe is closed.
    pub async fn try_send(&mut self, frame: Frame) -> Result<(), CodecError> {
        self.framed.send(frame).await
    }

    /// Write raw bytes, bypassing the encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write raw bytes");
        stream.flush().await.expect("flush raw bytes");
    }

    /// Read the next frame within `limit`.
    ///
    /// Returns `Ok(None)` once the connection has closed its side and
    /// `Err(())` if nothing arrived in time.
    #[expect(clippy::result_unit_err, reason = "timeouts carry no detail in tests")]
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Option<Frame>, ()> {
        if let Some(frame) = self.stash.pop_front() {
            return Ok(Some(frame));
        }
        match timeout(limit, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(_)) | None) => Ok(None),
            Err(_) => Err(()),
        }
    }

    /// Read the next frame, panicking on timeout or EOF.
    pub async fn recv(&mut self) -> Frame {
        self.recv_timeout(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while waiting for a frame")
    }

    /// Read frames until one matches `pred`, stashing the others.
    pub async fn recv_until(&mut self, mut pred: impl FnMut(&Frame) -> bool) -> Frame {
        let mut skipped = VecDeque::new();
        let found = loop {
            let frame = self.recv().await;
            if pred(&frame) {
                break frame;
            }
            skipped.push_back(frame);
        };
        skipped.append(&mut self.stash);
        self.stash = skipped;
        found
    }

    /// Read every frame until the connection closes.
    pub async fn recv_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self
            .recv_timeout(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for the connection to close")
        {
            frames.push(frame);
        }
        frames
    }

    /// Exchange SETTINGS with the connection.
    ///
    /// Sends `settings`, then waits for the server's SETTINGS and for the
    /// acknowledgement of ours. Returns the server's settings; any other
    /// frames read on the way are kept for later calls.
    pub async fn handshake(&mut self, settings: &[Setting]) -> Vec<Setting> {
        self.send(Frame::settings(settings)).await;
        let mut server = None;
        let mut acked = false;
        let mut other = VecDeque::new();
        while server.is_none() || !acked {
            let frame = self.recv().await;
            match frame.kind() {
                FrameKind::Settings if frame.is_ack() => acked = true,
                FrameKind::Settings => {
                    server = Some(frame.settings_payload().expect("valid server settings"));
                    self.send(Frame::settings_ack()).await;
                }
                _ => other.push_back(frame),
            }
        }
        other.append(&mut self.stash);
        self.stash = other;
        server.unwrap_or_default()
    }

    /// Open stream `id` with a complete header block.
    pub async fn open_stream(&mut self, id: u32, metadata: &'static [u8], end_stream: bool) {
        self.send(Frame::headers(
            StreamId::new(id),
            Bytes::from_static(metadata),
            end_stream,
            true,
        ))
        .await;
    }

    /// Send a DATA frame on stream `id`.
    pub async fn send_data(&mut self, id: u32, data: &[u8], end_stream: bool) {
        self.send(Frame::data(
            StreamId::new(id),
            Bytes::copy_from_slice(data),
            end_stream,
        ))
        .await;
    }

    /// Close the client's write side.
    pub async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.framed.get_mut().shutdown().await;
    }
}

/// DATA payload delivered for `id`, concatenated.
#[must_use]
pub fn body_of(frames: &[Frame], id: u32) -> Bytes {
    let id = StreamId::new(id);
    let mut body = BytesMut::new();
    for frame in frames
        .iter()
        .filter(|f| f.kind() == FrameKind::Data && f.stream_id() == id)
    {
        body.extend_from_slice(frame.payload());
    }
    body.freeze()
}

/// Every `RST_STREAM` in `frames` as `(stream, code)`.
#[must_use]
pub fn resets_in(frames: &[Frame]) -> Vec<(StreamId, ErrorCode)> {
    frames
        .iter()
        .filter(|f| f.kind() == FrameKind::RstStream)
        .filter_map(|f| f.reset_code().ok().map(|code| (f.stream_id(), code)))
        .collect()
}

/// Every `GOAWAY` in `frames` as `(last_stream_id, code)`.
#[must_use]
pub fn goaways_in(frames: &[Frame]) -> Vec<(StreamId, ErrorCode)> {
    frames
        .iter()
        .filter(|f| f.kind() == FrameKind::GoAway)
        .filter_map(|f| {
            f.go_away_payload()
                .ok()
                .map(|g| (g.last_stream_id, g.error_code))
        })
        .collect()
}

/// A connection running on a background task with its client peer.
pub struct TestConnection {
    pub peer: TestPeer,
    pub handle: ConnectionHandle,
    pub task: JoinHandle<Result<ConnectionReport, ConnectionError>>,
}

impl TestConnection {
    /// Wait for the connection task to finish.
    pub async fn join(self) -> Result<ConnectionReport, ConnectionError> {
        timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("connection task did not finish")
            .expect("connection task panicked")
    }
}

/// Run `handler` behind a [`Connection`] on an in-memory pipe.
///
/// # Panics
///
/// Panics if `config` is invalid.
pub fn spawn_connection<H>(handler: H, config: ConnectionConfig) -> TestConnection
where
    H: StreamHandler,
{
    let (client, server) = duplex(PIPE_CAPACITY);
    let connection =
        Connection::new(server, Arc::new(handler), config).expect("valid connection config");
    let handle = connection.handle();
    let task = tokio::spawn(connection.run());
    TestConnection {
        peer: TestPeer::new(client),
        handle,
        task,
    }
}
