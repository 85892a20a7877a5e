//! Errors raised by [`MuxServer`](super::MuxServer) operations.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that may occur while binding or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[from] io::Error),
    /// The connection configuration is invalid.
    #[error("invalid connection config: {0}")]
    Config(#[from] ConfigError),
}
