//! Live connection gauge and its RAII guard.

use std::sync::atomic::{AtomicU64, Ordering};

static LIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Guard counting one live connection for as long as it exists.
#[derive(Debug)]
pub(super) struct LiveConnection;

impl LiveConnection {
    pub(super) fn new() -> Self {
        LIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        LIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Number of connections currently alive in this process.
#[must_use]
pub fn active_connection_count() -> u64 { LIVE_CONNECTIONS.load(Ordering::Relaxed) }
