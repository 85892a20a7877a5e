//! Stream handlers with controllable behaviour.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use muxframe::{
    frame::ErrorCode,
    handler::{HandlerError, Request, ResponseWriter, StreamHandler},
};
use tokio::sync::watch;

/// Response metadata sent by the handlers in this module.
pub const OK_METADATA: &[u8] = b":status 200";

/// Echoes the request metadata and body back on the same stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn call(&self, mut req: Request, mut res: ResponseWriter) -> Result<(), HandlerError> {
        res.send_headers(req.metadata().clone(), false)?;
        let mut body = BytesMut::new();
        while let Some(chunk) = req.body_mut().chunk().await {
            body.extend_from_slice(&chunk);
        }
        res.send_data(body.freeze(), true).await?;
        Ok(())
    }
}

/// Shared switch that holds [`GatedHandler`] invocations until opened.
#[derive(Clone, Debug)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
    entered: Arc<watch::Sender<usize>>,
}

impl Default for Gate {
    fn default() -> Self { Self::new() }
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: Arc::new(watch::channel(false).0),
            entered: Arc::new(watch::channel(0).0),
        }
    }

    /// Release every waiting and future invocation.
    pub fn open(&self) { self.open.send_replace(true); }

    /// Wait until `count` invocations have reached the gate.
    pub async fn wait_entered(&self, count: usize) {
        let mut rx = self.entered.subscribe();
        let _ = rx.wait_for(|entered| *entered >= count).await;
    }

    async fn pass(&self) {
        self.entered.send_modify(|entered| *entered += 1);
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Sends response headers, blocks until its [`Gate`] opens, then sends a
/// fixed body.
#[derive(Clone, Debug)]
pub struct GatedHandler {
    gate: Gate,
    body: Bytes,
}

impl GatedHandler {
    #[must_use]
    pub fn new(gate: Gate, body: &'static [u8]) -> Self {
        Self {
            gate,
            body: Bytes::from_static(body),
        }
    }
}

#[async_trait]
impl StreamHandler for GatedHandler {
    async fn call(&self, _req: Request, mut res: ResponseWriter) -> Result<(), HandlerError> {
        res.send_headers(Bytes::from_static(OK_METADATA), false)?;
        self.gate.pass().await;
        res.send_data(self.body.clone(), true).await?;
        Ok(())
    }
}

/// Sends response headers and then never finishes.
///
/// Tracks how many invocations started and how many were dropped, so tests
/// can check that cancellation reached the handler.
#[derive(Clone, Debug, Default)]
pub struct StallingHandler {
    started: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
    completed: Arc<AtomicBool>,
}

impl StallingHandler {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn started(&self) -> usize { self.started.load(Ordering::SeqCst) }

    /// Invocations whose future was dropped before finishing.
    #[must_use]
    pub fn dropped(&self) -> usize { self.dropped.load(Ordering::SeqCst) }

    /// Always `false`; set only if a stalled invocation somehow returned.
    #[must_use]
    pub fn completed(&self) -> bool { self.completed.load(Ordering::SeqCst) }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

#[async_trait]
impl StreamHandler for StallingHandler {
    async fn call(&self, _req: Request, mut res: ResponseWriter) -> Result<(), HandlerError> {
        let _guard = DropCounter(Arc::clone(&self.dropped));
        self.started.fetch_add(1, Ordering::SeqCst);
        res.send_headers(Bytes::from_static(OK_METADATA), false)?;
        std::future::pending::<()>().await;
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every stream with a fixed outcome.
#[derive(Clone, Debug)]
pub enum FailingHandler {
    /// Return [`HandlerError::Stream`] with this code.
    Stream(ErrorCode),
    /// Return [`HandlerError::Protocol`].
    Protocol,
    /// Panic inside the handler.
    Panic,
}

#[async_trait]
impl StreamHandler for FailingHandler {
    async fn call(&self, _req: Request, _res: ResponseWriter) -> Result<(), HandlerError> {
        match self {
            Self::Stream(code) => Err(HandlerError::Stream(*code)),
            Self::Protocol => Err(HandlerError::Protocol("handler gave up".into())),
            Self::Panic => panic!("handler exploded"),
        }
    }
}

/// Writes a response body of `len` bytes without reading the request.
#[derive(Clone, Copy, Debug)]
pub struct BulkHandler {
    pub len: usize,
}

#[async_trait]
impl StreamHandler for BulkHandler {
    async fn call(&self, _req: Request, mut res: ResponseWriter) -> Result<(), HandlerError> {
        res.send_headers(Bytes::from_static(OK_METADATA), false)?;
        res.send_data(Bytes::from(vec![0xAB; self.len]), true).await?;
        Ok(())
    }
}
