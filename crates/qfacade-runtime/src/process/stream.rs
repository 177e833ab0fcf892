//! Async output readers (non-UTF8-safe).
//!
//! Model runners are C/C++ tooling and can emit non-UTF8 bytes. Lines are read
//! as bytes and decoded lossily so the reader never dies on bad output.
//!
//! Interactive runners print their input prompt without a trailing newline.
//! When a terminal marker is configured, a partial line that ends with it is
//! flushed immediately instead of waiting for a newline that never comes.

use std::sync::Arc;

use qfacade_core::ports::{OutputStream, ProcessLogSink};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// One captured line, tagged with the incarnation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub epoch: u64,
    pub stream: OutputStream,
    /// When the reader saw the line.
    pub at: Instant,
    pub text: String,
}

/// What the output channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(OutputLine),
    /// The stream reached EOF (the child closed it or exited).
    Closed { epoch: u64, stream: OutputStream },
}

/// Reader for one pipe of one incarnation.
pub struct StreamReader {
    pub name: Arc<str>,
    pub epoch: u64,
    pub stream: OutputStream,
    /// Flush partial lines ending with this marker.
    pub terminal_marker: Option<String>,
    /// Request-facing channel; `None` for diagnostics-only streams.
    pub output: Option<broadcast::Sender<OutputEvent>>,
    pub sink: Arc<dyn ProcessLogSink>,
}

impl StreamReader {
    /// Read `pipe` until EOF on a dedicated task.
    pub fn spawn(self, pipe: impl AsyncRead + Unpin + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(pipe).await })
    }

    async fn run(self, pipe: impl AsyncRead + Unpin) {
        let mut reader = BufReader::new(pipe);
        let mut pending: Vec<u8> = Vec::with_capacity(1024);

        loop {
            let chunk = match reader.fill_buf().await {
                Ok([]) => break,
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(process = %self.name, stream = %self.stream, error = %e, "Output reader exiting due to read error");
                    break;
                }
            };
            let len = chunk.len();
            pending.extend_from_slice(chunk);
            reader.consume(len);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.emit(&line);
            }

            if self.ends_with_marker(&pending) {
                self.emit(&pending);
                pending.clear();
            }
        }

        if !pending.is_empty() {
            self.emit(&pending);
        }

        if let Some(tx) = &self.output {
            let _ = tx.send(OutputEvent::Closed {
                epoch: self.epoch,
                stream: self.stream,
            });
        }
        debug!(process = %self.name, stream = %self.stream, epoch = self.epoch, "Output reader task exiting");
    }

    fn ends_with_marker(&self, pending: &[u8]) -> bool {
        let Some(marker) = self.terminal_marker.as_deref() else {
            return false;
        };
        !pending.is_empty() && pending.trim_ascii_end().ends_with(marker.as_bytes())
    }

    fn emit(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes).into_owned();
        debug!(process = %self.name, stream = %self.stream, epoch = self.epoch, "{text}");

        self.sink.append(&self.name, self.epoch, self.stream, &text);

        if let Some(tx) = &self.output {
            // No receivers is fine; output is still kept in the log sink.
            let _ = tx.send(OutputEvent::Line(OutputLine {
                epoch: self.epoch,
                stream: self.stream,
                at: Instant::now(),
                text,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::logs::ProcessLogBuffer;
    use tokio::io::AsyncWriteExt;

    fn reader(
        marker: Option<&str>,
        logs: Arc<ProcessLogBuffer>,
    ) -> (StreamReader, broadcast::Receiver<OutputEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let reader = StreamReader {
            name: Arc::from("model"),
            epoch: 3,
            stream: OutputStream::Stdout,
            terminal_marker: marker.map(str::to_string),
            output: Some(tx),
            sink: logs,
        };
        (reader, rx)
    }

    fn text(event: &OutputEvent) -> Option<&str> {
        match event {
            OutputEvent::Line(line) => Some(&line.text),
            OutputEvent::Closed { .. } => None,
        }
    }

    #[tokio::test]
    async fn test_lines_are_split_tagged_and_logged() {
        let logs = Arc::new(ProcessLogBuffer::new());
        let (reader, mut rx) = reader(None, logs.clone());
        let (mut write, read) = tokio::io::duplex(256);

        let handle = reader.spawn(read);
        write.write_all(b"hello\r\nthe answer\n").await.unwrap();
        drop(write);
        handle.await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(text(&first), Some("hello"));
        if let OutputEvent::Line(line) = &first {
            assert_eq!(line.epoch, 3);
        }
        assert_eq!(text(&rx.recv().await.unwrap()), Some("the answer"));
        assert_eq!(
            rx.recv().await.unwrap(),
            OutputEvent::Closed {
                epoch: 3,
                stream: OutputStream::Stdout
            }
        );
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_marker_line_is_flushed() {
        let logs = Arc::new(ProcessLogBuffer::new());
        let (reader, mut rx) = reader(Some("prompt >>"), logs);
        let (mut write, read) = tokio::io::duplex(256);

        let _handle = reader.spawn(read);
        write.write_all(b"4\nprompt >> ").await.unwrap();

        assert_eq!(text(&rx.recv().await.unwrap()), Some("4"));
        assert_eq!(text(&rx.recv().await.unwrap()), Some("prompt >> "));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_reader() {
        let logs = Arc::new(ProcessLogBuffer::new());
        let (reader, mut rx) = reader(None, logs);
        let (mut write, read) = tokio::io::duplex(256);

        let _handle = reader.spawn(read);
        write.write_all(b"bad \xff byte\nstill here\n").await.unwrap();

        assert!(text(&rx.recv().await.unwrap()).unwrap().starts_with("bad "));
        assert_eq!(text(&rx.recv().await.unwrap()), Some("still here"));
    }
}
