//! Outbound path: per-stream queues, fair scheduling and the single writer.
//!
//! Handler output lands in a per-stream queue. Each flush first runs the
//! fair scheduler, which moves frames from those queues into the shared
//! outbox while reserving flow-control credit, and then writes the outbox to
//! the transport in order. A frame is popped from the outbox only after the
//! sink has accepted it, so abandoning a flush never loses a frame.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use futures::SinkExt;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Semaphore, mpsc},
};

use super::Connection;
use crate::{
    error::{ConnectionError, Result},
    fairness::{Backlog, Turn},
    flow::{FlowController, FlowScope},
    frame::{ErrorCode, Frame, StreamId},
    handler::{HandlerError, StreamCommand, StreamHandler, StreamOutcome},
    metrics::{self, Direction},
    registry::StreamState,
};

/// Output queued by a handler and not yet scheduled.
#[derive(Debug)]
pub(super) enum Pending {
    Headers { block: Bytes, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
}

/// Connection-side bookkeeping for one live stream.
#[derive(Debug)]
pub(super) struct StreamSlot {
    /// Sender feeding the handler's request body; dropped at end of input.
    pub(super) body: Option<mpsc::UnboundedSender<Bytes>>,
    pub(super) queue: VecDeque<Pending>,
    /// Response bytes the handler may still queue.
    pub(super) budget: Arc<Semaphore>,
    pub(super) weight: u16,
    /// Frames for this stream sitting in the outbox.
    pub(super) in_flight: usize,
    /// Body bytes delivered to the handler but not yet read.
    pub(super) unconsumed: usize,
    pub(super) headers_queued: bool,
    pub(super) end_queued: bool,
    pub(super) handler_done: bool,
    pub(super) outcome: Option<StreamOutcome>,
}

impl StreamSlot {
    pub(super) fn new(budget: Arc<Semaphore>, weight: u16) -> Self {
        Self {
            body: None,
            queue: VecDeque::new(),
            budget,
            weight,
            in_flight: 0,
            unconsumed: 0,
            headers_queued: false,
            end_queued: false,
            handler_done: false,
            outcome: None,
        }
    }
}

/// A frame waiting to be written.
#[derive(Debug)]
pub(super) struct Outgoing {
    pub(super) frame: Frame,
    /// Live stream the frame belongs to, if it is tracked.
    pub(super) stream: Option<StreamId>,
    /// Send credit reserved for the payload.
    pub(super) reserved: u32,
    /// Writing this frame ends the local side of `stream`.
    pub(super) ends_stream: bool,
}

impl Outgoing {
    pub(super) fn control(frame: Frame) -> Self {
        Self {
            frame,
            stream: None,
            reserved: 0,
            ends_stream: false,
        }
    }

    fn stream(frame: Frame, id: StreamId, reserved: u32, ends_stream: bool) -> Self {
        Self {
            frame,
            stream: Some(id),
            reserved,
            ends_stream,
        }
    }
}

/// Split a header block into `HEADERS` plus `CONTINUATION` frames.
fn push_header_block(
    outbox: &mut VecDeque<Outgoing>,
    id: StreamId,
    mut block: Bytes,
    end_stream: bool,
    max_frame: usize,
) -> usize {
    let mut first = true;
    let mut frames = 0;
    loop {
        let fragment = block.split_to(block.len().min(max_frame));
        let last = block.is_empty();
        let frame = if first {
            Frame::headers(id, fragment, end_stream, last)
        } else {
            Frame::continuation(id, fragment, last)
        };
        outbox.push_back(Outgoing::stream(frame, id, 0, end_stream && last));
        frames += 1;
        first = false;
        if last {
            return frames;
        }
    }
}

/// Move queued output for one stream into the outbox within `allowance` bytes.
fn serve(
    id: StreamId,
    slot: &mut StreamSlot,
    allowance: usize,
    flow: &mut FlowController,
    outbox: &mut VecDeque<Outgoing>,
    max_frame: usize,
) -> Turn {
    let mut frames = 0;
    let mut bytes = 0;
    while let Some(front) = slot.queue.front_mut() {
        match front {
            Pending::Headers { block, end_stream } => {
                let (block, end_stream) = (std::mem::take(block), *end_stream);
                slot.queue.pop_front();
                let pushed = push_header_block(outbox, id, block, end_stream, max_frame);
                slot.in_flight += pushed;
                frames += pushed;
            }
            Pending::Data { data, end_stream } if data.is_empty() => {
                let end_stream = *end_stream;
                slot.queue.pop_front();
                outbox.push_back(Outgoing::stream(
                    Frame::data(id, Bytes::new(), end_stream),
                    id,
                    0,
                    end_stream,
                ));
                slot.in_flight += 1;
                frames += 1;
            }
            Pending::Data { data, end_stream } => {
                if bytes >= allowance {
                    return Turn {
                        frames,
                        bytes,
                        backlog: Backlog::Pending,
                    };
                }
                let want = data.len().min(max_frame).min(allowance - bytes);
                let granted = flow.reserve(
                    FlowScope::Stream(id),
                    u32::try_from(want).unwrap_or(u32::MAX),
                );
                if granted == 0 {
                    return Turn {
                        frames,
                        bytes,
                        backlog: Backlog::Blocked,
                    };
                }
                let len = granted as usize;
                let chunk = data.split_to(len);
                let end = *end_stream && data.is_empty();
                if data.is_empty() {
                    slot.queue.pop_front();
                }
                slot.budget.add_permits(len);
                outbox.push_back(Outgoing::stream(Frame::data(id, chunk, end), id, granted, end));
                slot.in_flight += 1;
                frames += 1;
                bytes += len;
            }
        }
    }
    Turn::drained(frames, bytes)
}

impl<T, H> Connection<T, H>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    H: StreamHandler,
{
    pub(super) fn queue_control(&mut self, frame: Frame) {
        self.outbox.push_back(Outgoing::control(frame));
    }

    /// Queue `RST_STREAM` for a stream that has no live slot.
    pub(super) fn queue_bare_reset(&mut self, id: StreamId, code: ErrorCode) {
        warn!("stream reset: stream_id={id}, code={code}, tracked=false");
        metrics::inc_stream_resets();
        self.queue_control(Frame::reset(id, code));
    }

    pub(super) fn on_command(&mut self, command: StreamCommand) -> Result<()> {
        match command {
            StreamCommand::Headers {
                id,
                metadata,
                end_stream,
            } => self.enqueue(
                id,
                Pending::Headers {
                    block: metadata,
                    end_stream,
                },
            ),
            StreamCommand::Data {
                id,
                data,
                end_stream,
            } => self.enqueue(id, Pending::Data { data, end_stream }),
            StreamCommand::Consumed { id, len } => {
                // Credit for retired streams was already returned in bulk.
                if let Some(slot) = self.streams.get_mut(&id) {
                    slot.unconsumed = slot.unconsumed.saturating_sub(len);
                    self.return_credit(Some(id), len);
                }
            }
            StreamCommand::Finished { id, result } => return self.on_handler_finished(id, result),
        }
        Ok(())
    }

    fn enqueue(&mut self, id: StreamId, pending: Pending) {
        let live = self
            .registry
            .get(id)
            .is_ok_and(|record| record.state().accepts_local_data());
        let Some(slot) = self.streams.get_mut(&id) else {
            return;
        };
        if !live || slot.end_queued {
            return;
        }
        if matches!(pending, Pending::Data { .. }) && !slot.headers_queued {
            // Response metadata always precedes the body on the wire.
            slot.queue.push_back(Pending::Headers {
                block: Bytes::new(),
                end_stream: false,
            });
        }
        match &pending {
            Pending::Headers { end_stream, .. } => {
                slot.headers_queued = true;
                slot.end_queued = *end_stream;
            }
            Pending::Data { end_stream, .. } => slot.end_queued = *end_stream,
        }
        slot.queue.push_back(pending);
        self.scheduler.activate(id, slot.weight);
    }

    fn on_handler_finished(
        &mut self,
        id: StreamId,
        result: Option<std::result::Result<(), HandlerError>>,
    ) -> Result<()> {
        let Some(slot) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        slot.handler_done = true;
        match result {
            // Cancelled: the stream was reset or aborted first.
            None => Ok(()),
            Some(Ok(())) => {
                if !slot.end_queued {
                    let end = if slot.headers_queued {
                        Pending::Data {
                            data: Bytes::new(),
                            end_stream: true,
                        }
                    } else {
                        Pending::Headers {
                            block: Bytes::new(),
                            end_stream: true,
                        }
                    };
                    self.enqueue(id, end);
                }
                self.complete_if_response_done(id);
                Ok(())
            }
            Some(Err(HandlerError::Stream(code))) => {
                warn!("handler failed: stream_id={id}, code={code}");
                self.reset_stream(id, code, StreamOutcome::Reset(code));
                Ok(())
            }
            Some(Err(HandlerError::Protocol(reason))) => {
                Err(ConnectionError::Handler {
                    stream_id: id,
                    reason,
                })
            }
        }
    }

    /// Close a stream whose response is complete while the peer is still
    /// sending; the peer is told to stop with `RST_STREAM(NO_ERROR)`.
    pub(super) fn complete_if_response_done(&mut self, id: StreamId) {
        let Some(slot) = self.streams.get_mut(&id) else {
            return;
        };
        let half_closed = self
            .registry
            .get(id)
            .is_ok_and(|record| record.state() == StreamState::HalfClosedLocal);
        if !half_closed || !slot.handler_done || slot.in_flight > 0 || !slot.queue.is_empty() {
            return;
        }
        if self.registry.terminate(id, StreamState::Closed) {
            slot.outcome = Some(StreamOutcome::Completed);
            slot.body = None;
            slot.in_flight += 1;
            self.outbox.push_back(Outgoing::stream(
                Frame::reset(id, ErrorCode::NoError),
                id,
                0,
                false,
            ));
        }
    }

    /// Return received credit to the peer once enough has been consumed.
    pub(super) fn return_credit(&mut self, stream: Option<StreamId>, len: usize) {
        let updates = self
            .flow
            .consume(stream, u32::try_from(len).unwrap_or(u32::MAX));
        if let Some(increment) = updates.connection {
            self.queue_control(Frame::window_update(StreamId::ZERO, increment));
        }
        if let (Some(id), Some(increment)) = (stream, updates.stream)
            && self
                .registry
                .get(id)
                .is_ok_and(|record| record.state().accepts_remote_data())
        {
            self.queue_control(Frame::window_update(id, increment));
        }
    }

    /// Drop everything queued for `id` and return its reserved credit.
    pub(super) fn discard_output(&mut self, id: StreamId) {
        let Self {
            scheduler,
            streams,
            outbox,
            flow,
            ..
        } = self;
        scheduler.remove(id);
        let Some(slot) = streams.get_mut(&id) else {
            return;
        };
        slot.queue.clear();
        slot.budget.close();
        slot.body = None;
        outbox.retain(|out| {
            if out.stream != Some(id) {
                return true;
            }
            flow.release(FlowScope::Stream(id), out.reserved);
            slot.in_flight = slot.in_flight.saturating_sub(1);
            false
        });
    }

    /// Reset a live stream from this side.
    ///
    /// Cancels the handler, purges the stream's queued output and queues
    /// `RST_STREAM(code)`. Does nothing if the stream already ended.
    pub(super) fn reset_stream(&mut self, id: StreamId, code: ErrorCode, outcome: StreamOutcome) {
        if !self.registry.terminate(id, StreamState::Reset) {
            return;
        }
        self.discard_output(id);
        if let Some(slot) = self.streams.get_mut(&id) {
            slot.outcome = Some(outcome);
            slot.in_flight += 1;
        }
        if outcome == StreamOutcome::Aborted {
            debug!("stream aborted: stream_id={id}");
        } else {
            warn!("stream reset: stream_id={id}, code={code}, tracked=true");
        }
        metrics::inc_stream_resets();
        self.outbox
            .push_back(Outgoing::stream(Frame::reset(id, code), id, 0, false));
    }

    fn schedule(&mut self) {
        let Self {
            scheduler,
            streams,
            flow,
            outbox,
            peer_max_frame_size,
            ..
        } = self;
        let max_frame = *peer_max_frame_size;
        scheduler.run(|id, allowance| match streams.get_mut(&id) {
            Some(slot) => serve(id, slot, allowance, flow, outbox, max_frame),
            None => Turn::drained(0, 0),
        });
    }

    /// Schedule queued output, write the outbox, flush, then retire finished streams.
    pub(super) async fn flush_pending(&mut self) -> Result<()> {
        self.schedule();
        if self.write_outbox().await? {
            self.writer.flush().await?;
        }
        self.reap();
        Ok(())
    }

    /// Write every outbox frame into the sink. Returns `true` if anything was written.
    pub(super) async fn write_outbox(&mut self) -> Result<bool> {
        let mut wrote = false;
        while let Some(out) = self.outbox.front() {
            let frame = out.frame.clone();
            self.writer.feed(frame).await?;
            wrote = true;
            metrics::inc_frames(Direction::Outbound);
            if let Some(out) = self.outbox.pop_front() {
                self.after_write(&out);
            }
        }
        Ok(wrote)
    }

    fn after_write(&mut self, out: &Outgoing) {
        let Some(id) = out.stream else {
            return;
        };
        if let Some(slot) = self.streams.get_mut(&id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        if out.ends_stream {
            let _ = self.registry.transition(id, StreamState::close_local);
            self.complete_if_response_done(id);
        }
    }

    /// Remove streams that have reached a terminal state and have nothing
    /// left in the outbox.
    pub(super) fn reap(&mut self) {
        let finished: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(id, slot)| {
                slot.in_flight == 0
                    && self
                        .registry
                        .get(**id)
                        .map_or(true, |record| record.state().is_terminal())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.retire(id, StreamOutcome::Completed);
        }
    }

    /// Drop all bookkeeping for `id` and record its outcome.
    pub(super) fn retire(&mut self, id: StreamId, fallback: StreamOutcome) {
        let Some(slot) = self.streams.remove(&id) else {
            return;
        };
        slot.budget.close();
        self.scheduler.remove(id);
        self.flow.close_stream(id);
        if slot.unconsumed > 0 {
            self.return_credit(None, slot.unconsumed);
        }
        self.registry.remove(id);
        let outcome = slot.outcome.unwrap_or(fallback);
        match outcome {
            StreamOutcome::Completed => self.report.completed_streams += 1,
            StreamOutcome::Reset(_) => self.report.reset_streams += 1,
            StreamOutcome::Aborted => self.report.aborted_streams.push(id),
        }
        debug!(
            "stream closed: stream_id={id}, outcome={outcome:?}, open_streams={}",
            self.registry.open_count()
        );
    }
}

/// Live streams with queued output, for diagnostics.
pub(super) fn queued_streams(streams: &HashMap<StreamId, StreamSlot>) -> usize {
    streams.values().filter(|slot| !slot.queue.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::flow::DEFAULT_WINDOW_SIZE;

    fn slot() -> StreamSlot { StreamSlot::new(Arc::new(Semaphore::new(0)), 16) }

    #[rstest]
    fn header_blocks_are_split_into_continuations() {
        let mut outbox = VecDeque::new();
        let frames = push_header_block(
            &mut outbox,
            StreamId::new(1),
            Bytes::from(vec![7u8; 40]),
            true,
            16,
        );
        assert_eq!(frames, 3);
        let kinds: Vec<_> = outbox.iter().map(|o| o.frame.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                crate::frame::FrameKind::Headers,
                crate::frame::FrameKind::Continuation,
                crate::frame::FrameKind::Continuation
            ]
        );
        assert!(outbox[0].frame.is_end_stream());
        assert!(!outbox[0].frame.is_end_headers());
        assert!(outbox[2].frame.is_end_headers());
        assert!(outbox[2].ends_stream);
        assert!(!outbox[0].ends_stream);
    }

    #[rstest]
    fn data_is_bounded_by_credit_and_frame_size() {
        let id = StreamId::new(1);
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.open_stream(id);
        let mut slot = slot();
        slot.queue.push_back(Pending::Data {
            data: Bytes::from(vec![1u8; 70_000]),
            end_stream: true,
        });
        let mut outbox = VecDeque::new();
        let turn = serve(id, &mut slot, usize::MAX, &mut flow, &mut outbox, 16_384);
        assert_eq!(turn.backlog, Backlog::Blocked);
        assert_eq!(turn.bytes, DEFAULT_WINDOW_SIZE as usize);
        assert!(outbox.iter().all(|o| o.frame.len() <= 16_384));
        assert!(outbox.iter().all(|o| !o.ends_stream));
        assert_eq!(slot.in_flight, outbox.len());
        assert_eq!(slot.budget.available_permits(), DEFAULT_WINDOW_SIZE as usize);
    }

    #[rstest]
    fn empty_end_marker_needs_no_credit() {
        let id = StreamId::new(1);
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.open_stream(id);
        flow.reserve(FlowScope::Stream(id), DEFAULT_WINDOW_SIZE);
        let mut slot = slot();
        slot.queue.push_back(Pending::Data {
            data: Bytes::new(),
            end_stream: true,
        });
        let mut outbox = VecDeque::new();
        let turn = serve(id, &mut slot, 1024, &mut flow, &mut outbox, 16_384);
        assert_eq!(turn.backlog, Backlog::Drained);
        assert!(outbox[0].ends_stream);
        assert!(outbox[0].frame.is_end_stream());
    }

    #[test]
    fn counts_streams_with_queued_output() {
        let mut streams = HashMap::new();
        let mut busy = slot();
        busy.queue.push_back(Pending::Data {
            data: Bytes::from_static(b"x"),
            end_stream: false,
        });
        streams.insert(StreamId::new(1), busy);
        streams.insert(StreamId::new(3), slot());
        assert_eq!(queued_streams(&streams), 1);
    }
}
