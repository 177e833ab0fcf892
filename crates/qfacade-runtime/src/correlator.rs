//! Attribution of unframed child output to one request.
//!
//! The model runner prints free-form lines and a fixed terminal marker when it
//! is ready for the next prompt. An exchange pre-drains whatever is already
//! buffered, opens a [`CorrelationWindow`] at the moment the prompt is written
//! and collects lines from the same incarnation until the marker arrives.
//!
//! Unsolicited output printed inside the window cannot be told apart from the
//! answer; the pre-drain and the response timeout are the only defences.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qfacade_core::{FacadeError, ModelSettings, TimeoutPhase};
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::process::{OutputEvent, OutputLine};

/// Line-oriented access to a supervised child.
#[async_trait]
pub trait LineChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Output events from now on.
    fn subscribe(&self) -> broadcast::Receiver<OutputEvent>;

    /// Write one line; returns the epoch that received it.
    async fn write_line(&self, line: &str) -> Result<u64, FacadeError>;

    /// A response on incarnation `epoch` never terminated; the child may be
    /// wedged.
    fn on_response_timeout(&self, epoch: u64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub terminal_marker: String,
    /// Replacement for newlines inside a prompt.
    pub newline_escape: String,
    /// Drop a first collected line that repeats the prompt.
    pub strip_echo: bool,
    pub response_timeout: Duration,
}

impl CorrelatorConfig {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            terminal_marker: settings.terminal_marker.clone(),
            newline_escape: settings.newline_escape.clone(),
            strip_echo: settings.strip_echo,
            response_timeout: settings.response_timeout(),
        }
    }
}

/// The interval in which output is attributed to the active request.
///
/// Opens when the prompt is written; closed by the terminal marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationWindow {
    pub epoch: u64,
    pub opened_at: Instant,
}

impl CorrelationWindow {
    /// Whether `line` may belong to the request that opened this window.
    pub fn admits(&self, line: &OutputLine) -> bool {
        line.epoch == self.epoch && line.at >= self.opened_at
    }
}

/// Result of one prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub text: String,
    pub window: CorrelationWindow,
    pub closed_at: Instant,
    /// Lines dropped as stale (pre-drained, other epoch or lost to lag).
    pub discarded: u64,
}

pub struct StreamCorrelator {
    channel: Arc<dyn LineChannel>,
    config: CorrelatorConfig,
    rx: Mutex<broadcast::Receiver<OutputEvent>>,
}

impl StreamCorrelator {
    pub fn new(channel: Arc<dyn LineChannel>, config: CorrelatorConfig) -> Self {
        let rx = channel.subscribe();
        Self {
            channel,
            config,
            rx: Mutex::new(rx),
        }
    }

    pub const fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Send `prompt` and collect the reply.
    ///
    /// Exchanges never overlap: the receiver is held for the whole exchange.
    /// Collection stops at `deadline` or after the response timeout,
    /// whichever comes first.
    pub async fn exchange(&self, prompt: &str, deadline: Instant) -> Result<Exchange, FacadeError> {
        let mut rx = self.rx.lock().await;
        let name = self.channel.name();

        let mut discarded = drain(&mut rx);
        if discarded > 0 {
            debug!(process = %name, discarded, "Discarded stale output before prompt");
        }

        let line = escape_newlines(prompt, &self.config.newline_escape);
        let opened_at = Instant::now();
        let epoch = self.channel.write_line(&line).await?;
        let window = CorrelationWindow { epoch, opened_at };
        let closes_by = deadline.min(opened_at + self.config.response_timeout);

        let mut collected: Vec<String> = Vec::new();
        let mut first = true;

        loop {
            let event = match timeout_at(closes_by, rx.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(process = %name, skipped, "Output receiver lagged, lines lost");
                    discarded += skipped;
                    continue;
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(FacadeError::crashed(name, "output channel closed"));
                }
                Err(_) => {
                    warn!(process = %name, epoch, collected = collected.len(), "No terminal marker before timeout");
                    self.channel.on_response_timeout(epoch);
                    return Err(FacadeError::RequestTimeout {
                        phase: TimeoutPhase::Executing,
                        after: closes_by.saturating_duration_since(opened_at),
                    });
                }
            };

            let output = match event {
                OutputEvent::Closed { epoch: closed, .. } if closed == epoch => {
                    return Err(FacadeError::crashed(
                        name,
                        "output closed before the terminal marker",
                    ));
                }
                OutputEvent::Closed { .. } => continue,
                OutputEvent::Line(output) => output,
            };

            if !window.admits(&output) {
                debug!(process = %name, epoch = output.epoch, line = %output.text, "Discarded line outside the window");
                discarded += 1;
                continue;
            }

            let (text, terminal) = match strip_marker(&output.text, &self.config.terminal_marker) {
                Some(before) => (before, true),
                None => (output.text.as_str(), false),
            };

            let echo = first && self.config.strip_echo && text.trim() == line.trim();
            if !echo && !(terminal && text.trim().is_empty()) {
                collected.push(text.to_string());
            }
            first = false;

            if terminal {
                break;
            }
        }

        Ok(Exchange {
            text: collected.join("\n").trim().to_string(),
            window,
            closed_at: Instant::now(),
            discarded,
        })
    }
}

/// Discard everything already buffered.
fn drain(rx: &mut broadcast::Receiver<OutputEvent>) -> u64 {
    let mut count = 0;
    loop {
        match rx.try_recv() {
            Ok(_) => count += 1,
            Err(TryRecvError::Lagged(skipped)) => count += skipped,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return count,
        }
    }
}

fn escape_newlines(prompt: &str, escape: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', escape)
}

/// Text before `marker` when the line ends with it.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.trim_end()
        .strip_suffix(marker.trim_end())
        .map(str::trim_end)
}
