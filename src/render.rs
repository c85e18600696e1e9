//! Presentation boundary
//!
//! The core hands session output to a [`RenderSink`] and never interprets
//! the bytes itself; escape-sequence handling, glyph layout and windowing
//! all live behind this trait. The stock implementation copies bytes
//! straight to the hosting terminal, which does the interpretation for us.

use std::io::{self, Write};

use tracing::debug;

use crate::core::buffer::Buffer;
use crate::core::reaper::ExitStatus;

/// Consumer of session output.
///
/// Both methods run on the single dispatch thread, so implementations must
/// not block for long.
pub trait RenderSink {
    /// One call per successful non-empty read, in stream order.
    fn on_data(&mut self, data: Buffer);

    /// Fired exactly once, after every `on_data` for the session.
    fn on_session_ended(&mut self, status: ExitStatus);
}

/// Pass-through renderer: session output goes to stdout unmodified.
pub struct StdoutRenderer {
    stdout: io::Stdout,
}

impl StdoutRenderer {
    pub fn new() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }
}

impl Default for StdoutRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for StdoutRenderer {
    fn on_data(&mut self, data: Buffer) {
        // A broken stdout must not take down the dispatch loop.
        let result = self
            .stdout
            .write_all(&data)
            .and_then(|_| self.stdout.flush());
        if result.is_err() {
            debug!(len = data.len(), "dropped output, stdout unavailable");
        }
    }

    fn on_session_ended(&mut self, status: ExitStatus) {
        debug!(?status, "session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        data: Vec<u8>,
        ended: Option<ExitStatus>,
    }

    impl RenderSink for Recorder {
        fn on_data(&mut self, data: Buffer) {
            assert!(self.ended.is_none(), "data after session end");
            self.data.extend_from_slice(&data);
        }

        fn on_session_ended(&mut self, status: ExitStatus) {
            self.ended = Some(status);
        }
    }

    #[test]
    fn sink_accumulates_in_order() {
        let mut sink = Recorder::default();
        sink.on_data(Buffer::copy_from(b"hel"));
        sink.on_data(Buffer::copy_from(b"lo"));
        sink.on_session_ended(ExitStatus::Exited(0));
        assert_eq!(sink.data, b"hello");
        assert_eq!(sink.ended, Some(ExitStatus::Exited(0)));
    }
}
