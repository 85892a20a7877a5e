//! Formatting of panic payloads caught from handler and connection tasks.

use std::{any::Any, fmt};

/// Displays a caught panic payload.
///
/// `String` and `&'static str` payloads print as-is; anything else falls back
/// to `Debug`.
///
/// ```
/// use muxframe::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert_eq!(format_panic(Box::new(String::from("bang"))).to_string(), "bang");
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            f.write_str("<non-string panic>")
        }
    }
}

/// Wrap a panic payload for display.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }
