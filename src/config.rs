//! Per-connection configuration.
//!
//! [`ConnectionConfig`] carries the values the engine consumes. Loading is
//! left to the embedding application; the type derives `Deserialize` so it
//! can be read from any serde format, and durations are expressed in
//! milliseconds.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{
    flow::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE},
    frame::{DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MIN_MAX_FRAME_SIZE, Setting},
};

/// Default grace period granted to in-flight streams on shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Default bound on the final flush and close after draining ends.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether the abortive path emits a second, final `GOAWAY`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalGoAway {
    /// Send a closing `GOAWAY` carrying `CANCEL` after resetting open streams.
    #[default]
    Send,
    /// Rely on the initial announcement only.
    Skip,
}

/// Errors raised by [`ConnectionConfig::validate`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent_streams must be at least 1")]
    ZeroConcurrency,
    #[error("window size {0} exceeds {MAX_WINDOW_SIZE}")]
    WindowTooLarge(u32),
    #[error("max_frame_size {0} outside {MIN_MAX_FRAME_SIZE}..={MAX_MAX_FRAME_SIZE}")]
    FrameSizeOutOfRange(u32),
    #[error("stream_buffer_size must be between 1 and {max}")]
    InvalidStreamBuffer { max: usize },
    #[error("control_frame_rate must be at least 1")]
    ZeroControlRate,
}

/// Configuration values consumed by a [`Connection`](crate::connection::Connection).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long in-flight streams may run after shutdown is requested.
    #[serde(rename = "grace_period_ms", with = "millis")]
    pub grace_period: Duration,
    /// Upper bound on flushing and closing the transport once draining ends.
    #[serde(rename = "teardown_timeout_ms", with = "millis")]
    pub teardown_timeout: Duration,
    /// Maximum number of concurrently open streams.
    pub max_concurrent_streams: usize,
    /// Initial stream-level receive window advertised to the peer.
    pub initial_window_size: u32,
    /// Connection-level receive window.
    pub connection_window_size: u32,
    /// Maximum inbound frame payload.
    pub max_frame_size: u32,
    /// Upper bound on an assembled header block.
    pub max_header_block_size: usize,
    /// Response bytes a handler may queue before it is suspended.
    pub stream_buffer_size: usize,
    /// `PING` and `SETTINGS` frames accepted per second.
    pub control_frame_rate: usize,
    /// Whether the abortive path sends a final `GOAWAY`.
    pub abortive_goaway: FinalGoAway,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            max_concurrent_streams: 100,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            connection_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_block_size: 64 * 1024,
            stream_buffer_size: 64 * 1024,
            control_frame_rate: 100,
            abortive_goaway: FinalGoAway::Send,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    #[must_use]
    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    #[must_use]
    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size;
        self
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_control_frame_rate(mut self, rate: usize) -> Self {
        self.control_frame_rate = rate;
        self
    }

    #[must_use]
    pub fn with_abortive_goaway(mut self, final_goaway: FinalGoAway) -> Self {
        self.abortive_goaway = final_goaway;
        self
    }

    /// Check that every value lies within protocol limits.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        for window in [self.initial_window_size, self.connection_window_size] {
            if window > MAX_WINDOW_SIZE {
                return Err(ConfigError::WindowTooLarge(window));
            }
        }
        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::FrameSizeOutOfRange(self.max_frame_size));
        }
        let max_buffer = tokio::sync::Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        if self.stream_buffer_size == 0 || self.stream_buffer_size > max_buffer {
            return Err(ConfigError::InvalidStreamBuffer { max: max_buffer });
        }
        if self.control_frame_rate == 0 {
            return Err(ConfigError::ZeroControlRate);
        }
        Ok(())
    }

    /// Settings advertised to the peer when the connection starts.
    #[must_use]
    pub fn local_settings(&self) -> Vec<Setting> {
        vec![
            Setting::MaxConcurrentStreams(
                u32::try_from(self.max_concurrent_streams).unwrap_or(u32::MAX),
            ),
            Setting::InitialWindowSize(self.initial_window_size),
            Setting::MaxFrameSize(self.max_frame_size),
        ]
    }
}

mod millis {
    //! Serde adapter reading durations as integer milliseconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectionConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.grace_period, Duration::from_secs(30));
    }

    #[rstest]
    #[case(ConnectionConfig::default().with_max_concurrent_streams(0), ConfigError::ZeroConcurrency)]
    #[case(
        ConnectionConfig::default().with_initial_window_size(MAX_WINDOW_SIZE + 1),
        ConfigError::WindowTooLarge(MAX_WINDOW_SIZE + 1)
    )]
    #[case(
        ConnectionConfig::default().with_max_frame_size(1024),
        ConfigError::FrameSizeOutOfRange(1024)
    )]
    #[case(ConnectionConfig::default().with_control_frame_rate(0), ConfigError::ZeroControlRate)]
    fn rejects_invalid_values(#[case] config: ConnectionConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }

    #[test]
    fn local_settings_reflect_config() {
        let settings = ConnectionConfig::default()
            .with_max_concurrent_streams(7)
            .local_settings();
        assert!(settings.contains(&Setting::MaxConcurrentStreams(7)));
    }

    #[test]
    fn deserializes_with_defaults() {
        let value = serde::de::value::MapDeserializer::<_, serde::de::value::Error>::new(
            [("grace_period_ms", 250u64), ("max_concurrent_streams", 4u64)].into_iter(),
        );
        let config = ConnectionConfig::deserialize(value).expect("deserialize config");
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_streams, 4);
        assert_eq!(config.initial_window_size, DEFAULT_WINDOW_SIZE);
    }
}
