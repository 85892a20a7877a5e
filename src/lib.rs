#![doc(html_root_url = "https://docs.rs/muxframe/latest")]
//! Public API for the `muxframe` library.
//!
//! This crate provides a multiplexed, flow-controlled connection engine:
//! many logical streams share one ordered transport, each stream is served
//! by its own handler task, and shutdown drains in-flight streams for a
//! bounded grace period before aborting the rest.

pub mod byte_order;
pub mod config;
pub mod connection;
pub mod error;
mod fairness;
pub mod flow;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod panic;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConnectionConfig, FinalGoAway};
pub use connection::{
    CloseKind,
    Connection,
    ConnectionHandle,
    ConnectionReport,
    ConnectionState,
    active_connection_count,
};
pub use error::{ConnectionError, Result, StreamError};
pub use frame::{ErrorCode, Frame, FrameCodec, FrameKind, StreamId};
pub use handler::{
    HandlerError,
    Request,
    RequestBody,
    ResponseWriter,
    StreamHandler,
    StreamOutcome,
    handler_fn,
};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, FRAMES_PROCESSED, SHUTDOWNS_TOTAL, STREAM_RESETS};
pub use server::{BackoffConfig, MuxServer, ServerError};
pub use session::{ConnectionId, ConnectionRegistry};
