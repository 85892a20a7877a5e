//! Tokio-based TCP server running one [`Connection`] per socket.
//!
//! `MuxServer` spawns worker tasks to accept TCP connections and drives each
//! accepted socket as a multiplexed [`Connection`] sharing one
//! [`StreamHandler`]. Stopping the server asks every live connection to drain
//! and waits for all of them to close.
//!
//! [`Connection`]: crate::connection::Connection

use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot};

use crate::{config::ConnectionConfig, handler::StreamHandler};

mod binding;
mod connection;
pub mod error;
mod runtime;

pub use error::ServerError;
/// Re-exported configuration types for server backoff behavior.
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;

/// Tokio-based server for multiplexed connections.
///
/// The server carries a typestate `S` indicating whether it is [`Unbound`]
/// (not yet bound to a TCP listener) or [`Bound`]. New servers start
/// `Unbound` and must call [`bind`](MuxServer::bind) or
/// [`bind_existing_listener`](MuxServer::bind_existing_listener) before
/// running. Every worker task accepts from the shared listener.
pub struct MuxServer<H, S = Unbound>
where
    H: StreamHandler,
    S: ServerState,
{
    pub(crate) handler: Arc<H>,
    pub(crate) config: ConnectionConfig,
    pub(crate) workers: usize,
    pub(crate) backoff_config: BackoffConfig,
    /// Channel used to notify when the server is ready.
    ///
    /// A `oneshot::Sender` can transmit only one readiness notification, so a
    /// new `ready_tx` must be provided each time the server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) state: S,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

impl<H> MuxServer<H, Unbound>
where
    H: StreamHandler,
{
    /// Create a server dispatching every stream to `handler`.
    ///
    /// The worker count defaults to the number of available CPU cores (or 1
    /// if this cannot be determined).
    #[must_use]
    pub fn new(handler: H, config: ConnectionConfig) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            handler: Arc::new(handler),
            config,
            workers,
            backoff_config: BackoffConfig::default(),
            ready_tx: None,
            state: Unbound,
        }
    }
}

impl<H, S> MuxServer<H, S>
where
    H: StreamHandler,
    S: ServerState,
{
    /// Set the number of worker tasks to spawn for the server.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Replace the accept-loop back-off configuration.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff_config = BackoffConfig::new(backoff.initial_delay, backoff.max_delay);
        self
    }

    /// Configure a channel used to signal when the server is ready to accept connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// Returns the configured number of worker tasks for the server.
    #[inline]
    #[must_use]
    pub const fn worker_count(&self) -> usize { self.workers }

    /// Configuration applied to every accepted connection.
    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig { &self.config }
}
