//! Accept-loop utilities for server runtime.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::warn;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::BackoffConfig;
use crate::{
    handler::StreamHandler,
    server::connection::{ConnectionShared, spawn_connection_task},
};

/// Abstraction for sources of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

pub(in crate::server) struct AcceptLoopOptions<H> {
    pub shared: ConnectionShared<H>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
}

/// Accepts incoming connections and spawns connection tasks.
///
/// Failures to accept a connection trigger an exponential back-off governed
/// by `options.backoff`. The loop terminates when `options.shutdown` is
/// cancelled; connection tasks are tracked by `options.tracker`.
pub(in crate::server) async fn accept_loop<H, L>(listener: Arc<L>, options: AcceptLoopOptions<H>)
where
    H: StreamHandler,
    L: AcceptListener + 'static,
{
    let AcceptLoopOptions {
        shared,
        shutdown,
        tracker,
        backoff,
    } = options;
    let mut pacer = backoff.pacer();
    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    spawn_connection_task(stream, shared.clone(), &tracker);
                    pacer.succeeded();
                }
                Err(e) => {
                    let local_addr = listener.local_addr().ok();
                    let delay = pacer.failed();
                    warn!(
                        "accept error: error={e:?}, local_addr={local_addr:?}, retry_in_ms={}",
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            },
        }
    }
}
