//! Application handler interface.
//!
//! A [`StreamHandler`] is invoked once per accepted stream with a
//! [`Request`] (stream id, opaque request metadata and a readable body) and
//! a [`ResponseWriter`]. Handlers run as their own tasks; the connection
//! keeps serving other streams while any handler is suspended.
//!
//! Handlers never touch the transport. Everything they produce travels to
//! the connection task as a [`StreamCommand`] and is written by that single
//! task. Response bytes are bounded per stream: [`ResponseWriter::send_data`]
//! suspends once `stream_buffer_size` bytes are queued and resumes as the
//! connection schedules them onto the wire.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::StreamError,
    frame::{ErrorCode, StreamId},
};

/// Failure reported by a handler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Reset the stream with the given code; other streams are unaffected.
    #[error("stream failure: {0}")]
    Stream(ErrorCode),
    /// The handler detected a protocol-level fault; the connection is closed.
    #[error("protocol fault: {0}")]
    Protocol(String),
}

impl From<StreamError> for HandlerError {
    fn from(err: StreamError) -> Self { Self::Stream(err.code) }
}

/// How a stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The handler finished and every response frame was written.
    Completed,
    /// The stream was reset by either side.
    Reset(ErrorCode),
    /// The stream was still open when the connection was torn down.
    Aborted,
}

/// Messages sent from handler tasks to the connection task.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    Headers {
        id: StreamId,
        metadata: Bytes,
        end_stream: bool,
    },
    Data {
        id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The handler read `len` body bytes; receive credit can be returned.
    Consumed { id: StreamId, len: usize },
    /// The handler returned. `None` means it was cancelled first.
    Finished {
        id: StreamId,
        result: Option<Result<(), HandlerError>>,
    },
}

/// Per-stream application logic.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Serve one stream.
    ///
    /// The future may be dropped at any suspension point when the stream is
    /// reset or the connection is torn down; dropping counts as an aborted
    /// outcome, never a successful one.
    async fn call(&self, request: Request, response: ResponseWriter) -> Result<(), HandlerError>;
}

/// Adapter implementing [`StreamHandler`] for an async closure.
#[derive(Clone)]
pub struct HandlerFn<F>(F);

/// Wrap a closure as a [`StreamHandler`].
///
/// ```
/// use muxframe::handler::{HandlerError, handler_fn};
///
/// let handler = handler_fn(|_request, mut response| async move {
///     response.send_headers(bytes::Bytes::from_static(b"ok"), true)?;
///     Ok::<(), HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> StreamHandler for HandlerFn<F>
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, request: Request, response: ResponseWriter) -> Result<(), HandlerError> {
        (self.0)(request, response).await
    }
}

/// Request half handed to a handler.
#[derive(Debug)]
pub struct Request {
    stream_id: StreamId,
    metadata: Bytes,
    body: RequestBody,
}

impl Request {
    pub(crate) fn new(stream_id: StreamId, metadata: Bytes, body: RequestBody) -> Self {
        Self {
            stream_id,
            metadata,
            body,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId { self.stream_id }

    /// Opaque request metadata (the assembled header block).
    #[must_use]
    pub fn metadata(&self) -> &Bytes { &self.metadata }

    /// Mutable access to the request body.
    pub fn body_mut(&mut self) -> &mut RequestBody { &mut self.body }

    /// Split into metadata and body.
    #[must_use]
    pub fn into_parts(self) -> (Bytes, RequestBody) { (self.metadata, self.body) }
}

/// Readable request body.
///
/// Yields payload chunks in arrival order and ends when the peer half-closes
/// the stream or the stream is reset. Every chunk handed out returns its
/// receive credit to the connection.
#[derive(Debug)]
pub struct RequestBody {
    stream_id: StreamId,
    chunks: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl RequestBody {
    pub(crate) fn new(
        stream_id: StreamId,
        chunks: mpsc::UnboundedReceiver<Bytes>,
        commands: mpsc::UnboundedSender<StreamCommand>,
    ) -> Self {
        Self {
            stream_id,
            chunks,
            commands,
        }
    }

    /// Receive the next chunk, or `None` at end of body.
    pub async fn chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.recv().await?;
        self.acknowledge(chunk.len());
        Some(chunk)
    }

    fn acknowledge(&self, len: usize) {
        if len > 0 {
            // The connection may already be gone; credit is then irrelevant.
            let _ = self.commands.send(StreamCommand::Consumed {
                id: self.stream_id,
                len,
            });
        }
    }
}

impl Stream for RequestBody {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.acknowledge(chunk.len());
                Poll::Ready(Some(chunk))
            }
            other => other,
        }
    }
}

/// Writable response half handed to a handler.
#[derive(Debug)]
pub struct ResponseWriter {
    stream_id: StreamId,
    commands: mpsc::UnboundedSender<StreamCommand>,
    budget: Arc<Semaphore>,
    capacity: usize,
    cancel: CancellationToken,
    ended: bool,
}

impl ResponseWriter {
    pub(crate) fn new(
        stream_id: StreamId,
        commands: mpsc::UnboundedSender<StreamCommand>,
        budget: Arc<Semaphore>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_id,
            commands,
            budget,
            capacity: capacity.max(1),
            cancel,
            ended: false,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId { self.stream_id }

    /// Returns `true` once the stream has been reset or aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Resolve when the stream is reset or aborted.
    pub async fn cancelled(&self) { self.cancel.cancelled().await; }

    /// Queue response metadata.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] if the stream was reset, already ended or the
    /// connection has gone away.
    pub fn send_headers(&mut self, metadata: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.ensure_writable()?;
        self.push(StreamCommand::Headers {
            id: self.stream_id,
            metadata,
            end_stream,
        })?;
        self.ended = end_stream;
        Ok(())
    }

    /// Queue response payload, suspending while the stream's buffer is full.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] if the stream was reset, already ended or the
    /// connection has gone away.
    pub async fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.ensure_writable()?;
        loop {
            let chunk = data.split_to(data.len().min(self.capacity));
            let last = data.is_empty();
            let permits = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(self.cancelled_error()),
                permit = self.budget.acquire_many(permits) => {
                    permit.map_err(|_| self.cancelled_error())?.forget();
                }
            }
            self.push(StreamCommand::Data {
                id: self.stream_id,
                data: chunk,
                end_stream: end_stream && last,
            })?;
            if last {
                break;
            }
        }
        self.ended = end_stream;
        Ok(())
    }

    /// Returns `true` once `END_STREAM` has been queued.
    #[must_use]
    pub fn is_ended(&self) -> bool { self.ended }

    fn ensure_writable(&self) -> Result<(), StreamError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }
        if self.ended {
            return Err(StreamError::new(self.stream_id, ErrorCode::StreamClosed));
        }
        Ok(())
    }

    fn push(&self, command: StreamCommand) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| self.cancelled_error())
    }

    fn cancelled_error(&self) -> StreamError { StreamError::new(self.stream_id, ErrorCode::Cancel) }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    type WriterParts = (
        ResponseWriter,
        mpsc::UnboundedReceiver<StreamCommand>,
        Arc<Semaphore>,
        CancellationToken,
    );

    fn writer(capacity: usize) -> WriterParts {
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(Semaphore::new(capacity));
        let cancel = CancellationToken::new();
        let writer = ResponseWriter::new(
            StreamId::new(1),
            tx,
            Arc::clone(&budget),
            capacity,
            cancel.clone(),
        );
        (writer, rx, budget, cancel)
    }

    #[tokio::test]
    async fn data_larger_than_buffer_is_split() {
        let (mut writer, mut rx, budget, _cancel) = writer(4);
        let task = tokio::spawn(async move {
            writer
                .send_data(Bytes::from_static(b"abcdefghij"), true)
                .await
        });
        let mut seen = Vec::new();
        while let Some(command) = rx.recv().await {
            let StreamCommand::Data {
                data, end_stream, ..
            } = command
            else {
                panic!("unexpected command");
            };
            budget.add_permits(data.len());
            seen.push((data, end_stream));
            if end_stream {
                break;
            }
        }
        task.await.expect("join").expect("send");
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0.as_ref(), b"abcd");
        assert!(seen[2].1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_writer() {
        let (mut writer, _rx, _budget, cancel) = writer(2);
        let task =
            tokio::spawn(async move { writer.send_data(Bytes::from_static(b"abcd"), false).await });
        tokio::task::yield_now().await;
        cancel.cancel();
        let err = task.await.expect("join").expect_err("cancelled");
        assert_eq!(err.code, ErrorCode::Cancel);
    }

    #[tokio::test]
    async fn writes_after_end_are_rejected() {
        let (mut writer, _rx, _budget, _cancel) = writer(16);
        writer
            .send_headers(Bytes::from_static(b"meta"), true)
            .expect("headers");
        let err = writer
            .send_data(Bytes::from_static(b"x"), false)
            .await
            .expect_err("ended");
        assert_eq!(err.code, ErrorCode::StreamClosed);
    }

    #[tokio::test]
    async fn body_acknowledges_consumed_bytes() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut body = RequestBody::new(StreamId::new(3), chunk_rx, cmd_tx);
        chunk_tx.send(Bytes::from_static(b"hello")).expect("send");
        drop(chunk_tx);
        assert_eq!(body.next().await.as_deref(), Some(&b"hello"[..]));
        assert!(body.next().await.is_none());
        assert!(matches!(
            cmd_rx.recv().await,
            Some(StreamCommand::Consumed { len: 5, .. })
        ));
    }

    #[test]
    fn stream_errors_convert_to_resets() {
        let err = HandlerError::from(StreamError::new(StreamId::new(1), ErrorCode::Cancel));
        assert_eq!(err, HandlerError::Stream(ErrorCode::Cancel));
    }
}
