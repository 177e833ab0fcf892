//! Bounded per-process log capture.
//!
//! Every line a supervised child prints lands here, whether or not a request
//! is outstanding. Readiness probes scan it for ready patterns.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use qfacade_core::ports::{OutputStream, ProcessLogSink};
use serde::{Deserialize, Serialize};

/// Maximum number of log lines to keep per process.
const MAX_LOG_LINES: usize = 5000;

/// A single captured line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub epoch: u64,
    pub stream: OutputStream,
    pub line: String,
}

/// Ring buffer of recent output for one process.
#[derive(Debug)]
pub struct ProcessLogBuffer {
    lines: RwLock<VecDeque<ProcessLogEntry>>,
    capacity: usize,
}

impl Default for ProcessLogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity.min(MAX_LOG_LINES))),
            capacity: capacity.max(1),
        }
    }

    /// Add an entry, removing the oldest if at capacity.
    pub fn push(&self, entry: ProcessLogEntry) {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<ProcessLogEntry> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Whether any line printed by incarnation `epoch` contains one of
    /// `patterns`.
    pub fn contains_any(&self, epoch: u64, patterns: &[String]) -> bool {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines
            .iter()
            .rev()
            .take_while(|entry| entry.epoch >= epoch)
            .filter(|entry| entry.epoch == epoch)
            .any(|entry| patterns.iter().any(|p| entry.line.contains(p.as_str())))
    }

    pub fn clear(&self) {
        self.lines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ProcessLogSink for ProcessLogBuffer {
    fn append(&self, _name: &str, epoch: u64, stream: OutputStream, line: &str) {
        self.push(ProcessLogEntry {
            timestamp: Utc::now(),
            epoch,
            stream,
            line: line.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(buffer: &ProcessLogBuffer, epoch: u64, line: &str) {
        buffer.append("model", epoch, OutputStream::Stdout, line);
    }

    #[test]
    fn test_ring_drops_oldest() {
        let buffer = ProcessLogBuffer::with_capacity(3);
        for i in 0..5 {
            add(&buffer, 1, &format!("line {i}"));
        }
        let lines: Vec<_> = buffer.tail(10).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_patterns_only_match_current_epoch() {
        let buffer = ProcessLogBuffer::new();
        let patterns = vec!["LLM init ok".to_string()];

        add(&buffer, 1, "[I] LLM init ok");
        add(&buffer, 2, "loading weights");
        assert!(buffer.contains_any(1, &patterns));
        assert!(!buffer.contains_any(2, &patterns));

        add(&buffer, 2, "[I] LLM init ok");
        assert!(buffer.contains_any(2, &patterns));
    }

    #[test]
    fn test_tail_and_clear() {
        let buffer = ProcessLogBuffer::new();
        add(&buffer, 1, "a");
        add(&buffer, 1, "b");
        assert_eq!(buffer.tail(1)[0].line, "b");
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
