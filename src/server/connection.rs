//! Connection handling for [`MuxServer`](super::MuxServer).

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::FutureExt;
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::ConnectionConfig,
    connection::Connection,
    handler::StreamHandler,
    session::{ConnectionId, ConnectionRegistry},
};

/// State shared by every connection a server accepts.
pub(super) struct ConnectionShared<H> {
    pub handler: Arc<H>,
    pub config: ConnectionConfig,
    pub connections: Arc<ConnectionRegistry>,
    pub next_id: Arc<AtomicU64>,
    /// Cancelled when the server stops.
    pub shutdown: CancellationToken,
}

impl<H> Clone for ConnectionShared<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            connections: Arc::clone(&self.connections),
            next_id: Arc::clone(&self.next_id),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Spawn a task to process a single TCP connection, logging and discarding any panics.
pub(super) fn spawn_connection_task<H>(
    stream: TcpStream,
    shared: ConnectionShared<H>,
    tracker: &TaskTracker,
) where
    H: StreamHandler,
{
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Failed to retrieve peer address: error={e}");
            None
        }
    };
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(process_stream(stream, peer_addr, shared))
            .catch_unwind();

        if let Err(panic) = fut.await {
            let panic_msg = crate::panic::format_panic(panic);
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
            tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
        }
    });
}

async fn process_stream<H>(
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    shared: ConnectionShared<H>,
) where
    H: StreamHandler,
{
    let ConnectionShared {
        handler,
        config,
        connections,
        next_id,
        shutdown,
    } = shared;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to disable Nagle: error={e}, peer_addr={peer_addr:?}");
    }
    let id = ConnectionId::new(next_id.fetch_add(1, Ordering::Relaxed));
    let connection = match Connection::new(stream, handler, config) {
        Ok(connection) => connection.with_connection_id(id).with_peer_addr(peer_addr),
        Err(e) => {
            error!("invalid connection config: error={e}, peer_addr={peer_addr:?}");
            return;
        }
    };
    let handle = connection.handle();
    connections.insert(id, &handle);
    // Accepted while the server was stopping: the broadcast may have missed it.
    if shutdown.is_cancelled() {
        handle.request_shutdown();
    }
    drop(handle);

    match connection.run().await {
        Ok(report) => debug!(
            "connection finished: connection_id={id}, peer_addr={peer_addr:?}, close={}",
            report.close
        ),
        Err(e) => debug!(
            "connection finished with error: connection_id={id}, peer_addr={peer_addr:?}, \
             error={e}"
        ),
    }
    connections.remove(&id);
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::{Duration, timeout},
    };

    use super::*;
    use crate::handler::{Request, ResponseWriter, handler_fn};

    #[rstest]
    #[tokio::test]
    async fn connection_is_registered_until_it_closes() {
        let handler = handler_fn(|_req: Request, mut res: ResponseWriter| async move {
            res.send_headers(Bytes::new(), true)?;
            Ok(())
        });
        let shared = ConnectionShared {
            handler: Arc::new(handler),
            config: ConnectionConfig::default(),
            connections: Arc::new(ConnectionRegistry::default()),
            next_id: Arc::new(AtomicU64::new(7)),
            shutdown: CancellationToken::new(),
        };
        let connections = Arc::clone(&shared.connections);
        let tracker = TaskTracker::new();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("listener.local_addr");

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        spawn_connection_task(stream, shared, &tracker);

        // The server's SETTINGS frame proves the connection is running.
        let mut header = [0u8; 9];
        client.read_exact(&mut header).await.expect("read settings");
        assert_eq!(header[3], 0x4);
        let handle = connections
            .get(&ConnectionId::new(7))
            .expect("connection registered");
        drop(client);

        let report = timeout(Duration::from_secs(5), handle.closed())
            .await
            .expect("connection closes");
        drop(handle);
        tracker.close();
        tracker.wait().await;
        assert!(report.aborted_streams.is_empty());
        assert!(connections.active_ids().is_empty());
    }
}
