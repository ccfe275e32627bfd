//! Reporting of captured subprocess output.
//!
//! Every step prints the text its command wrote to stdout and stderr, each
//! under a fixed header. Any text at all on stderr marks the step as failed;
//! severity, exit codes and partial-success markers are not inspected.

use std::io::Write;

pub const STDOUT_HEADER: &str = "--- stdout ---";
pub const STDERR_HEADER: &str = "--- stderr ---";

/// Failure raised when a step wrote to its error stream.
///
/// Displays as the step's label and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Prints captured output blocks to a sink.
pub struct OutputReporter<W> {
    out: W,
}

impl<W: Write> OutputReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Print the stdout header followed by `text`.
    pub fn report_stdout(&mut self, text: &str) {
        self.print_block(STDOUT_HEADER, text);
    }

    /// Print the stderr header followed by `text`, then fail with `message`
    /// if `text` is non-empty.
    pub fn report_stderr(&mut self, text: &str, message: &str) -> Result<(), StepFailure> {
        self.print_block(STDERR_HEADER, text);

        if text.is_empty() {
            Ok(())
        } else {
            Err(StepFailure::new(message))
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn print_block(&mut self, header: &str, text: &str) {
        // A broken sink must not change how the step is classified
        if let Err(e) = writeln!(self.out, "{}\n{}", header, text).and_then(|_| self.out.flush()) {
            tracing::warn!("Failed to print {} block: {}", header, e);
        }
    }
}
