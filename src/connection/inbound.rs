//! Inbound path: routing decoded frames to streams and connection state.

use std::{panic::AssertUnwindSafe, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Semaphore, mpsc},
};
use tokio_util::sync::CancellationToken;

use super::{Connection, outbound::StreamSlot};
use crate::{
    error::{ConnectionError, Result},
    flow::{FlowScope, FlowControlError, MAX_WINDOW_SIZE},
    frame::{
        ErrorCode,
        Frame,
        FrameKind,
        MAX_MAX_FRAME_SIZE,
        MIN_MAX_FRAME_SIZE,
        PrioritySpec,
        Setting,
        StreamId,
    },
    handler::{
        HandlerError,
        Request,
        RequestBody,
        ResponseWriter,
        StreamCommand,
        StreamHandler,
        StreamOutcome,
    },
    metrics::{self, Direction},
    panic::format_panic,
    registry::{DEFAULT_WEIGHT, RegistryError, StreamState},
};

/// What to do once a header block is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum BlockTarget {
    /// Open a new stream and invoke the handler.
    Open,
    /// Trailing metadata ending the request body of a live stream.
    Trailers,
    /// The stream was refused or already closed; the block is read and dropped.
    Discard,
}

/// A header block spread over `HEADERS` and `CONTINUATION` frames.
#[derive(Debug)]
pub(super) struct HeaderBlock {
    stream_id: StreamId,
    buf: BytesMut,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    target: BlockTarget,
}

/// How many admitted stream ids are remembered to tell closed streams from
/// ids the peer skipped.
const OPENED_MEMORY: usize = 256;

fn weight_of(priority: PrioritySpec) -> u16 { u16::from(priority.weight) + 1 }

impl<T, H> Connection<T, H>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    H: StreamHandler,
{
    /// Apply one inbound frame.
    pub(super) fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        metrics::inc_frames(Direction::Inbound);
        if self.header_block.is_some() {
            return self.on_continuation(&frame);
        }
        match frame.kind() {
            FrameKind::Data => self.on_data(&frame),
            FrameKind::Headers => self.on_headers(&frame),
            FrameKind::Priority => self.on_priority(&frame),
            FrameKind::RstStream => self.on_peer_reset(&frame),
            FrameKind::Settings => self.on_settings(&frame),
            FrameKind::PushPromise => Err(ConnectionError::protocol(
                "PUSH_PROMISE is not valid from a client",
            )),
            FrameKind::Ping => self.on_ping(&frame),
            FrameKind::GoAway => {
                self.on_go_away(&frame)?;
                Ok(())
            }
            FrameKind::WindowUpdate => self.on_window_update(&frame),
            FrameKind::Continuation => Err(ConnectionError::protocol(format!(
                "CONTINUATION on stream {} without a header block in progress",
                frame.stream_id()
            ))),
            FrameKind::Unknown(kind) => {
                debug!("ignoring frame of unknown kind: kind={kind:#x}");
                Ok(())
            }
        }
    }

    /// A header block that will open a stream is still arriving.
    pub(super) fn opening_stream(&self) -> bool {
        self.header_block
            .as_ref()
            .is_some_and(|block| block.target == BlockTarget::Open)
    }

    /// Drop any header block in progress, returning the id it would have opened.
    pub(super) fn take_opening_block(&mut self) -> Option<StreamId> {
        self.header_block
            .take()
            .filter(|block| block.target == BlockTarget::Open)
            .map(|block| block.stream_id)
    }

    /// Whether `id`, at or below the last admitted id, once opened a stream.
    ///
    /// Ids older than the remembered window are assumed to have been opened.
    fn was_opened(&self, id: StreamId) -> bool {
        match self.opened.front() {
            Some(oldest) if id >= *oldest => self.opened.binary_search(&id).is_ok(),
            Some(_) => self.opened.len() == OPENED_MEMORY,
            None => false,
        }
    }

    fn check_block_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_header_block_size {
            return Err(ConnectionError::protocol(format!(
                "header block of {len} bytes exceeds {}",
                self.config.max_header_block_size
            )));
        }
        Ok(())
    }

    fn on_continuation(&mut self, frame: &Frame) -> Result<()> {
        let Some(block) = self.header_block.as_ref() else {
            return Ok(());
        };
        if frame.kind() != FrameKind::Continuation || frame.stream_id() != block.stream_id {
            return Err(ConnectionError::protocol(format!(
                "expected CONTINUATION for stream {}, got {:?} on stream {}",
                block.stream_id,
                frame.kind(),
                frame.stream_id()
            )));
        }
        self.check_block_size(block.buf.len() + frame.len())?;
        let Some(block) = self.header_block.as_mut() else {
            return Ok(());
        };
        block.buf.extend_from_slice(frame.payload());
        if frame.is_end_headers()
            && let Some(block) = self.header_block.take()
        {
            return self.complete_header_block(block);
        }
        Ok(())
    }

    fn complete_header_block(&mut self, block: HeaderBlock) -> Result<()> {
        let HeaderBlock {
            stream_id,
            buf,
            end_stream,
            priority,
            target,
        } = block;
        match target {
            BlockTarget::Open => self.open_stream(stream_id, buf.freeze(), priority, end_stream),
            BlockTarget::Trailers => {
                self.on_trailers(stream_id, end_stream);
                Ok(())
            }
            BlockTarget::Discard => Ok(()),
        }
    }

    fn on_headers(&mut self, frame: &Frame) -> Result<()> {
        let id = frame.stream_id();
        let (fragment, priority) = frame.content()?;
        self.check_block_size(fragment.len())?;
        let target = if self.streams.contains_key(&id) {
            BlockTarget::Trailers
        } else if id.is_client_initiated()
            && id <= self.last_peer_stream
            && self.was_opened(id)
        {
            // Already retired here; the peer may not have seen our reset yet.
            debug!("header block on closed stream: stream_id={id}");
            self.queue_bare_reset(id, ErrorCode::StreamClosed);
            BlockTarget::Discard
        } else {
            self.admit(id)?
        };
        if let Some(priority) = priority
            && priority.dependency == id
        {
            return Err(ConnectionError::protocol(format!(
                "stream {id} depends on itself"
            )));
        }
        let block = HeaderBlock {
            stream_id: id,
            buf: BytesMut::from(fragment.as_ref()),
            end_stream: frame.is_end_stream(),
            priority,
            target,
        };
        if frame.is_end_headers() {
            self.complete_header_block(block)
        } else {
            self.header_block = Some(block);
            Ok(())
        }
    }

    /// Decide whether a new stream id may open a stream.
    fn admit(&mut self, id: StreamId) -> Result<BlockTarget> {
        if !id.is_client_initiated() {
            return Err(ConnectionError::protocol(format!(
                "stream {id} was not initiated by the client"
            )));
        }
        if id <= self.last_peer_stream {
            return Err(ConnectionError::protocol(format!(
                "stream {id} is not above the last opened stream {}",
                self.last_peer_stream
            )));
        }
        self.last_peer_stream = id;
        self.opened.push_back(id);
        if self.opened.len() > OPENED_MEMORY {
            self.opened.pop_front();
        }
        if let Some(boundary) = self.goaway_boundary
            && id > boundary
        {
            debug!("stream beyond announced boundary: stream_id={id}, last_stream_id={boundary}");
            self.queue_bare_reset(id, ErrorCode::RefusedStream);
            return Ok(BlockTarget::Discard);
        }
        Ok(BlockTarget::Open)
    }

    fn open_stream(
        &mut self,
        id: StreamId,
        metadata: Bytes,
        priority: Option<PrioritySpec>,
        end_stream: bool,
    ) -> Result<()> {
        let record = match self.registry.create(id, &self.streams_cancel) {
            Ok(record) => record,
            Err(RegistryError::Refused { reason, .. }) => {
                warn!("stream refused: stream_id={id}, reason={reason}");
                self.queue_bare_reset(id, ErrorCode::RefusedStream);
                return Ok(());
            }
            Err(err) => {
                return Err(ConnectionError::with_code(
                    ErrorCode::InternalError,
                    err.to_string(),
                ));
            }
        };
        self.flow.open_stream(id);
        let weight = priority.map_or(DEFAULT_WEIGHT, weight_of);

        let budget = Arc::new(Semaphore::new(self.config.stream_buffer_size));
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let mut slot = StreamSlot::new(Arc::clone(&budget), weight);
        if end_stream {
            let _ = self.registry.transition(id, StreamState::close_remote);
        } else {
            slot.body = Some(body_tx);
        }
        self.streams.insert(id, slot);

        let request = Request::new(
            id,
            metadata,
            RequestBody::new(id, body_rx, self.commands_tx.clone()),
        );
        let response = ResponseWriter::new(
            id,
            self.commands_tx.clone(),
            budget,
            self.config.stream_buffer_size,
            record.cancel_token().clone(),
        );
        self.spawn_handler(id, record.cancel_token().clone(), request, response);
        debug!(
            "stream opened: stream_id={id}, weight={weight}, open_streams={}",
            self.registry.open_count()
        );
        Ok(())
    }

    fn spawn_handler(
        &self,
        id: StreamId,
        cancel: CancellationToken,
        request: Request,
        response: ResponseWriter,
    ) {
        let handler = Arc::clone(&self.handler);
        let commands = self.commands_tx.clone();
        self.tasks.spawn(async move {
            let call = AssertUnwindSafe(handler.call(request, response)).catch_unwind();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                outcome = call => Some(outcome.unwrap_or_else(|panic| {
                    let panic = format_panic(panic);
                    // Emit via both `log` and `tracing` for tests that capture either.
                    error!("stream handler panicked: stream_id={id}, panic={panic}");
                    tracing::error!(stream_id = %id, panic = %panic, "stream handler panicked");
                    Err(HandlerError::Stream(ErrorCode::InternalError))
                })),
            };
            let _ = commands.send(StreamCommand::Finished { id, result });
        });
    }

    fn on_trailers(&mut self, id: StreamId, end_stream: bool) {
        let state = self.registry.get(id).map(|record| record.state());
        match state {
            Ok(state) if state.accepts_remote_data() && end_stream => self.end_remote(id),
            Ok(state) if state.accepts_remote_data() => {
                self.reset_stream(
                    id,
                    ErrorCode::ProtocolError,
                    StreamOutcome::Reset(ErrorCode::ProtocolError),
                );
            }
            Ok(state) if !state.is_terminal() => {
                self.reset_stream(
                    id,
                    ErrorCode::StreamClosed,
                    StreamOutcome::Reset(ErrorCode::StreamClosed),
                );
            }
            _ => {}
        }
    }

    /// The peer finished sending on `id`.
    fn end_remote(&mut self, id: StreamId) {
        if let Some(slot) = self.streams.get_mut(&id) {
            slot.body = None;
        }
        let _ = self.registry.transition(id, StreamState::close_remote);
    }

    /// Charge `len` bytes to the connection window and hand the credit straight back.
    fn discard_payload(&mut self, len: u32) -> Result<()> {
        self.flow
            .receive(None, len)
            .map_err(|err| ConnectionError::with_code(ErrorCode::FlowControlError, err.to_string()))?;
        self.return_credit(None, len as usize);
        Ok(())
    }

    fn on_data(&mut self, frame: &Frame) -> Result<()> {
        let id = frame.stream_id();
        let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        let state = if self.streams.contains_key(&id) {
            self.registry.get(id).ok().map(|record| record.state())
        } else {
            None
        };
        match state {
            None if id > self.last_peer_stream => {
                if self.goaway_boundary.is_some_and(|boundary| id > boundary) {
                    self.discard_payload(len)?;
                    self.queue_bare_reset(id, ErrorCode::RefusedStream);
                    return Ok(());
                }
                return Err(ConnectionError::protocol(format!(
                    "DATA on idle stream {id}"
                )));
            }
            None => {
                self.discard_payload(len)?;
                self.queue_bare_reset(id, ErrorCode::StreamClosed);
                return Ok(());
            }
            Some(state) if !state.accepts_remote_data() => {
                self.discard_payload(len)?;
                if !state.is_terminal() {
                    self.reset_stream(
                        id,
                        ErrorCode::StreamClosed,
                        StreamOutcome::Reset(ErrorCode::StreamClosed),
                    );
                }
                return Ok(());
            }
            Some(_) => {}
        }

        match self.flow.receive(Some(id), len) {
            Ok(()) => {}
            Err(err @ FlowControlError::ReceiveWindowExceeded {
                scope: FlowScope::Stream(_),
                ..
            }) => {
                warn!("stream flow control violated: stream_id={id}, error={err}");
                self.return_credit(None, len as usize);
                self.reset_stream(
                    id,
                    ErrorCode::FlowControlError,
                    StreamOutcome::Reset(ErrorCode::FlowControlError),
                );
                return Ok(());
            }
            Err(err) => {
                return Err(ConnectionError::with_code(
                    ErrorCode::FlowControlError,
                    err.to_string(),
                ));
            }
        }

        let (content, _) = frame.content()?;
        let padding = frame.len() - content.len();
        if padding > 0 {
            self.return_credit(Some(id), padding);
        }
        if !content.is_empty() {
            let size = content.len();
            let delivered = match self.streams.get_mut(&id) {
                Some(slot) => {
                    let sent = slot.body.as_ref().is_some_and(|tx| tx.send(content).is_ok());
                    if sent {
                        slot.unconsumed += size;
                    }
                    sent
                }
                None => false,
            };
            if !delivered {
                self.return_credit(Some(id), size);
            }
        }
        if frame.is_end_stream() {
            self.end_remote(id);
        }
        Ok(())
    }

    fn on_priority(&mut self, frame: &Frame) -> Result<()> {
        let spec = frame.priority_spec()?;
        let id = frame.stream_id();
        if spec.dependency == id {
            if self.streams.contains_key(&id) {
                self.reset_stream(
                    id,
                    ErrorCode::ProtocolError,
                    StreamOutcome::Reset(ErrorCode::ProtocolError),
                );
            }
            return Ok(());
        }
        let weight = weight_of(spec);
        self.scheduler.set_weight(id, weight);
        if let Some(slot) = self.streams.get_mut(&id) {
            slot.weight = weight;
        }
        Ok(())
    }

    fn on_peer_reset(&mut self, frame: &Frame) -> Result<()> {
        let code = frame.reset_code()?;
        let id = frame.stream_id();
        if id > self.last_peer_stream {
            return Err(ConnectionError::protocol(format!(
                "RST_STREAM on idle stream {id}"
            )));
        }
        if self.registry.terminate(id, StreamState::Reset) {
            debug!("stream reset by peer: stream_id={id}, code={code}");
            metrics::inc_stream_resets();
            self.discard_output(id);
            if let Some(slot) = self.streams.get_mut(&id) {
                slot.outcome = Some(StreamOutcome::Reset(code));
            }
        }
        Ok(())
    }

    fn check_control_rate(&self, kind: FrameKind) -> Result<()> {
        if self.control_limiter.try_acquire(1) {
            return Ok(());
        }
        Err(ConnectionError::with_code(
            ErrorCode::EnhanceYourCalm,
            format!("{kind:?} frames exceed {} per second", self.config.control_frame_rate),
        ))
    }

    fn on_settings(&mut self, frame: &Frame) -> Result<()> {
        if frame.is_ack() {
            if !frame.is_empty() {
                return Err(ConnectionError::protocol("SETTINGS acknowledgement carries a payload"));
            }
            debug!("settings acknowledged by peer");
            return Ok(());
        }
        self.check_control_rate(FrameKind::Settings)?;
        for setting in frame.settings_payload()? {
            self.apply_setting(setting)?;
        }
        self.queue_control(Frame::settings_ack());
        Ok(())
    }

    fn apply_setting(&mut self, setting: Setting) -> Result<()> {
        match setting {
            Setting::InitialWindowSize(size) => {
                if size > MAX_WINDOW_SIZE {
                    return Err(ConnectionError::with_code(
                        ErrorCode::FlowControlError,
                        format!("initial window size {size} exceeds {MAX_WINDOW_SIZE}"),
                    ));
                }
                self.flow
                    .set_initial_send_window(size)
                    .map_err(|err| ConnectionError::with_code(ErrorCode::FlowControlError, err.to_string()))?;
            }
            Setting::MaxFrameSize(size) => {
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                    return Err(ConnectionError::protocol(format!(
                        "max frame size {size} out of range"
                    )));
                }
                self.peer_max_frame_size = size as usize;
                self.writer.encoder_mut().set_max_frame_size(size);
                self.scheduler.set_quantum(size as usize);
            }
            Setting::EnablePush(value) if value > 1 => {
                return Err(ConnectionError::protocol(format!(
                    "invalid ENABLE_PUSH value {value}"
                )));
            }
            Setting::HeaderTableSize(_)
            | Setting::EnablePush(_)
            | Setting::MaxConcurrentStreams(_)
            | Setting::MaxHeaderListSize(_)
            | Setting::Unknown(..) => {}
        }
        Ok(())
    }

    fn on_ping(&mut self, frame: &Frame) -> Result<()> {
        if frame.is_ack() {
            return Ok(());
        }
        self.check_control_rate(FrameKind::Ping)?;
        let opaque = frame.ping_payload()?;
        self.queue_control(Frame::ping(opaque, true));
        Ok(())
    }

    fn on_go_away(&mut self, frame: &Frame) -> Result<()> {
        let goaway = frame.go_away_payload()?;
        if goaway.error_code == ErrorCode::NoError {
            info!(
                "peer sent GOAWAY: last_stream_id={}, code={}",
                goaway.last_stream_id, goaway.error_code
            );
        } else {
            warn!(
                "peer sent GOAWAY: last_stream_id={}, code={}, debug={:?}",
                goaway.last_stream_id,
                goaway.error_code,
                String::from_utf8_lossy(&goaway.debug_data)
            );
        }
        self.begin_drain();
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame) -> Result<()> {
        let increment = frame.window_increment()?;
        let id = frame.stream_id();
        let scope = if id.is_zero() {
            FlowScope::Connection
        } else {
            FlowScope::Stream(id)
        };
        let Err(err) = self.flow.grant(scope, increment) else {
            return Ok(());
        };
        let code = match err {
            FlowControlError::ZeroIncrement { .. } => ErrorCode::ProtocolError,
            FlowControlError::Overflow { .. } | FlowControlError::ReceiveWindowExceeded { .. } => {
                ErrorCode::FlowControlError
            }
        };
        match err.scope() {
            FlowScope::Connection => Err(ConnectionError::with_code(code, err.to_string())),
            FlowScope::Stream(id) => {
                self.reset_stream(id, code, StreamOutcome::Reset(code));
                Ok(())
            }
        }
    }
}
