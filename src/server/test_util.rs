//! Test helpers shared across server modules.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use async_trait::async_trait;
use bytes::Bytes;
use rstest::fixture;

use super::{Bound, MuxServer};
use crate::{
    config::ConnectionConfig,
    handler::{HandlerError, Request, ResponseWriter, StreamHandler},
};

/// Echoes the request metadata and body back on the same stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn call(&self, mut req: Request, mut res: ResponseWriter) -> Result<(), HandlerError> {
        res.send_headers(req.metadata().clone(), false)?;
        let mut body = Vec::new();
        while let Some(chunk) = req.body_mut().chunk().await {
            body.extend_from_slice(&chunk);
        }
        res.send_data(Bytes::from(body), true).await?;
        Ok(())
    }
}

#[fixture]
pub fn echo_handler() -> EchoHandler { EchoHandler }

#[fixture]
/// Returns a bound [`StdTcpListener`] on a free port for use in tests.
///
/// Keeping the listener bound prevents race conditions where another
/// process could claim the port between discovery and use.
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

/// Extract the bound address from a listener.
#[must_use]
pub fn listener_addr(listener: &StdTcpListener) -> SocketAddr {
    listener
        .local_addr()
        .expect("failed to get listener address")
}

pub fn bind_server(
    handler: EchoHandler,
    listener: StdTcpListener,
) -> MuxServer<EchoHandler, Bound> {
    MuxServer::new(handler, ConnectionConfig::default())
        .bind_existing_listener(listener)
        .expect("Failed to bind")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_addr_matches_local_addr() {
        let listener = free_listener();
        assert_eq!(
            listener_addr(&listener),
            listener.local_addr().expect("failed to get address")
        );
    }
}
