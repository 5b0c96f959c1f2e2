//! Operator-facing progress lines.
//!
//! Every component reports through one injected sink. The host decides where the
//! lines go (terminal, log pane, nowhere); the device layer never assumes a destination.

use std::sync::Arc;

pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Progress goes to stderr so stdout carries only the JSON result.
pub fn stderr_sink() -> OutputSink {
    Arc::new(|line: &str| eprintln!("{line}"))
}

pub fn discard_sink() -> OutputSink {
    Arc::new(|_line: &str| {})
}
