//! Exclusive access to the process-wide log capture.

use std::sync::{Mutex, MutexGuard, OnceLock};

use logtest::Logger;
use rstest::fixture;

/// Handle to the global logger with exclusive access.
///
/// `logtest` installs one logger per process, so tests that inspect log
/// output serialise through this guard. Records left by earlier tests are
/// discarded on acquisition.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the global [`Logger`] and drop any stale records.
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while guard.pop().is_some() {}
        Self { guard }
    }

    /// Drain captured records, returning the messages that contain `needle`.
    pub fn messages_containing(&mut self, needle: &str) -> Vec<String> {
        let mut found = Vec::new();
        while let Some(record) = self.guard.pop() {
            let message = record.args().to_string();
            if message.contains(needle) {
                found.push(message);
            }
        }
        found
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
