//! Process log sink port for captured child output.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Port for appending child output lines to a sink.
///
/// Implementations should be thread-safe and non-blocking where possible.
pub trait ProcessLogSink: Send + Sync {
    /// Append a line (without trailing newline) produced by incarnation
    /// `epoch` of process `name`.
    fn append(&self, name: &str, epoch: u64, stream: OutputStream, line: &str);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogSink;

impl ProcessLogSink for NoopLogSink {
    fn append(&self, _name: &str, _epoch: u64, _stream: OutputStream, _line: &str) {}
}
