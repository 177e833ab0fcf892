//! In-memory fakes for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use qfacade_core::{ConversationTurn, FacadeError, OutputStream, TokenizerPort};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::correlator::LineChannel;
use crate::process::{OutputEvent, OutputLine};

/// Scripted child: every written line triggers the next canned reply.
pub struct FakeChannel {
    tx: broadcast::Sender<OutputEvent>,
    pub epoch: AtomicU64,
    replies: Mutex<VecDeque<Vec<OutputEvent>>>,
    pub written: Mutex<Vec<String>>,
    pub timeouts: AtomicUsize,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            epoch: AtomicU64::new(1),
            replies: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            timeouts: AtomicUsize::new(0),
        })
    }

    pub fn line(&self, text: &str) -> OutputEvent {
        self.line_from(self.epoch.load(Ordering::SeqCst), text)
    }

    pub fn line_from(&self, epoch: u64, text: &str) -> OutputEvent {
        OutputEvent::Line(OutputLine {
            epoch,
            stream: OutputStream::Stdout,
            at: Instant::now(),
            text: text.to_string(),
        })
    }

    /// Queue the events emitted in answer to the next written line.
    pub fn reply(&self, events: Vec<OutputEvent>) {
        self.replies.lock().unwrap().push_back(events);
    }

    /// Emit a line right now, outside any exchange.
    pub fn emit(&self, text: &str) {
        let _ = self.tx.send(self.line(text));
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl LineChannel for FakeChannel {
    fn name(&self) -> &str {
        "model"
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.tx.subscribe()
    }

    async fn write_line(&self, line: &str) -> Result<u64, FacadeError> {
        self.written.lock().unwrap().push(line.to_string());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        for event in reply {
            let event = match event {
                // Restamp so the line is emitted after the write.
                OutputEvent::Line(mut line) => {
                    line.at = Instant::now();
                    OutputEvent::Line(line)
                }
                closed => closed,
            };
            let _ = self.tx.send(event);
        }
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    fn on_response_timeout(&self, _epoch: u64) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Whitespace tokenizer; fails every call when `down`.
#[derive(Default)]
pub struct FakeTokenizer {
    pub down: bool,
    pub calls: AtomicUsize,
}

impl FakeTokenizer {
    fn call(&self) -> Result<(), FacadeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            Err(FacadeError::TokenizerUnavailable("sidecar down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TokenizerPort for FakeTokenizer {
    async fn encode(&self, text: &str) -> Result<Vec<u32>, FacadeError> {
        self.call()?;
        Ok((0..).zip(text.split_whitespace()).map(|(i, _)| i).collect())
    }

    async fn decode(&self, tokens: &[u32]) -> Result<String, FacadeError> {
        self.call()?;
        Ok(tokens
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn apply_template(
        &self,
        turns: &[ConversationTurn],
        template: Option<&str>,
    ) -> Result<String, FacadeError> {
        self.call()?;
        Ok(format!(
            "[{}] {}",
            template.unwrap_or("default"),
            turns
                .iter()
                .map(|t| format!("{}: {}", t.role, t.content))
                .collect::<Vec<_>>()
                .join(" | ")
        ))
    }
}
