//! Utilities for driving a [`Connection`](muxframe::connection::Connection)
//! with in-memory streams during tests.
//!
//! [`spawn_connection`] runs a handler behind a connection on one end of a
//! `tokio::io::duplex` pipe and hands back a [`TestPeer`] for the other end.
//!
//! ```rust
//! use muxframe::config::ConnectionConfig;
//! use muxframe_testing::{EchoHandler, spawn_connection};
//!
//! # async fn example() {
//! let mut conn = spawn_connection(EchoHandler, ConnectionConfig::default());
//! conn.peer.handshake(&[]).await;
//! conn.peer.open_stream(1, b"ping", true).await;
//! # }
//! ```

pub mod handlers;
pub mod logging;
pub mod macros;
pub mod peer;

pub use handlers::{
    BulkHandler,
    EchoHandler,
    FailingHandler,
    Gate,
    GatedHandler,
    OK_METADATA,
    StallingHandler,
};
pub use logging::{LoggerHandle, logger};
pub use peer::{
    PIPE_CAPACITY,
    RECV_TIMEOUT,
    TestConnection,
    TestPeer,
    body_of,
    goaways_in,
    resets_in,
    spawn_connection,
};
