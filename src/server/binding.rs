//! Listener binding for [`MuxServer`].

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use tokio::net::TcpListener;

use super::{Bound, MuxServer, ServerError, ServerState, Unbound};
use crate::handler::StreamHandler;

impl<H, S> MuxServer<H, S>
where
    H: StreamHandler,
    S: ServerState,
{
    fn bind_to_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<MuxServer<H, Bound>, ServerError> {
        let MuxServer {
            handler,
            config,
            workers,
            backoff_config,
            ready_tx,
            ..
        } = self;

        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let tokio_listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;

        Ok(MuxServer {
            handler,
            config,
            workers,
            backoff_config,
            ready_tx,
            state: Bound {
                listener: Arc::new(tokio_listener),
            },
        })
    }
}

impl<H> MuxServer<H, Unbound>
where
    H: StreamHandler,
{
    /// Return `None` as the server is not bound.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }

    /// Bind to a fresh address.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::net::{Ipv4Addr, SocketAddr};
    ///
    /// use muxframe::{
    ///     config::ConnectionConfig,
    ///     handler::{Request, ResponseWriter, handler_fn},
    ///     server::MuxServer,
    /// };
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let handler = handler_fn(|_req: Request, _res: ResponseWriter| async { Ok(()) });
    /// let server = MuxServer::new(handler, ConnectionConfig::default())
    ///     .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    ///     .expect("bind failed");
    /// assert!(server.local_addr().is_some());
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns a [`ServerError`] if binding or configuring the listener fails.
    pub fn bind(self, addr: SocketAddr) -> Result<MuxServer<H, Bound>, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Bind to an existing `StdTcpListener`.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if configuring the listener fails.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<MuxServer<H, Bound>, ServerError> {
        self.bind_to_listener(std_listener)
    }
}

impl<H> MuxServer<H, Bound>
where
    H: StreamHandler,
{
    /// Returns the bound address, or `None` if retrieving it fails.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }

    /// Rebind to a fresh address.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if binding or configuring the listener fails.
    pub fn bind(self, addr: SocketAddr) -> Result<Self, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Rebind using an existing `StdTcpListener`.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if configuring the listener fails.
    pub fn bind_existing_listener(self, std_listener: StdTcpListener) -> Result<Self, ServerError> {
        self.bind_to_listener(std_listener)
    }
}
