//! Runtime control for [`MuxServer`].

mod accept;
mod backoff;

use std::sync::{Arc, atomic::AtomicU64};

use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use futures::Future;
use log::{info, warn};
use tokio::{select, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Bound, MuxServer, ServerError, connection::ConnectionShared};
use crate::{handler::StreamHandler, session::ConnectionRegistry};

impl<H> MuxServer<H, Bound>
where
    H: StreamHandler,
{
    /// Run the server until a shutdown signal is received.
    ///
    /// Spawns the configured number of worker tasks and awaits Ctrl+C for shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the connection configuration is
    /// invalid. Accept failures are retried with exponential back-off and do
    /// not surface as errors.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the server until the `shutdown` future resolves.
    ///
    /// On shutdown the workers stop accepting, every live connection is asked
    /// to drain, and the call returns once all of them have closed. Each
    /// connection is bounded by its configured grace period.
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
    /// use tokio::sync::oneshot;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), muxframe::server::ServerError> {
    /// let handler = handler_fn(|_req: Request, _res: ResponseWriter| async { Ok(()) });
    /// let server = MuxServer::new(handler, ConnectionConfig::default())
    ///     .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    ///
    /// let (tx, rx) = oneshot::channel::<()>();
    /// let handle = tokio::spawn(server.run_with_shutdown(async {
    ///     let _ = rx.await;
    /// }));
    ///
    /// let _ = tx.send(());
    /// handle
    ///     .await
    ///     .expect("join server task")
    ///     .expect("server run failed");
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the connection configuration is
    /// invalid.
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let MuxServer {
            handler,
            config,
            workers,
            backoff_config,
            ready_tx,
            state: Bound { listener },
        } = self;
        config.validate()?;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let connections = Arc::new(ConnectionRegistry::default());
        let shared = ConnectionShared {
            handler,
            config,
            connections: Arc::clone(&connections),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: shutdown_token.clone(),
        };

        for _ in 0..workers {
            tracker.spawn(accept_loop(
                Arc::clone(&listener),
                AcceptLoopOptions {
                    shared: shared.clone(),
                    shutdown: shutdown_token.clone(),
                    tracker: tracker.clone(),
                    backoff: backoff_config,
                },
            ));
        }

        // Signal readiness after all workers have been spawned.
        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }

        select! {
            () = shutdown => shutdown_token.cancel(),
            () = tracker.wait() => {},
        }

        let draining = connections.shutdown_all();
        info!("server stopping: workers={workers}, draining_connections={draining}");
        tracker.close();
        tracker.wait().await;
        info!("server stopped");
        Ok(())
    }
}
