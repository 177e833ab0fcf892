//! Settings domain types and validation.
//!
//! Plain serde structs with defaults for every field, so a settings file only
//! has to name what it changes. Durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::backoff::RestartPolicy;

/// Default loopback port of the tokenizer sidecar.
pub const DEFAULT_TOKENIZER_PORT: u16 = 12345;

/// Default line printed by the model runner when it waits for input.
pub const DEFAULT_TERMINAL_MARKER: &str = "prompt >>";

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSettings,
    pub tokenizer: TokenizerSettings,
    pub supervisor: SupervisorSettings,
    pub queue: QueueSettings,
    pub generation: GenerationDefaults,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Parse a JSON settings document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(json).map_err(|e| SettingsError::Parse(e.to_string()))
    }
}

/// The resident model runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Name reported in completions.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Line (or line suffix) the runner prints when it is ready for input.
    pub terminal_marker: String,
    /// Output that signals the runner finished loading.
    pub ready_patterns: Vec<String>,
    /// Written to stdin to ask the runner to exit.
    pub quit_command: Option<String>,
    /// Replacement for newlines inside a prompt.
    pub newline_escape: String,
    /// Drop a first response line equal to the prompt.
    pub strip_echo: bool,
    pub startup_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Restart the runner when a response never terminates.
    pub restart_on_response_timeout: bool,
    pub pid_file: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "qwen2.5-1.5b-instruct".to_string(),
            program: "run_qwen2.5_1.5b_gptq_int4.sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            terminal_marker: DEFAULT_TERMINAL_MARKER.to_string(),
            ready_patterns: vec![
                "LLM init ok".to_string(),
                "Model loaded successfully".to_string(),
                "Ready to accept requests".to_string(),
                "Server listening".to_string(),
            ],
            quit_command: Some("q".to_string()),
            newline_escape: "\\n".to_string(),
            strip_echo: true,
            startup_timeout_ms: 60_000,
            response_timeout_ms: 30_000,
            restart_on_response_timeout: true,
            pid_file: None,
        }
    }
}

impl ModelSettings {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Where prompts are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSource {
    /// The built-in ChatML encoder.
    #[default]
    Local,
    /// The tokenizer's `/chat_template`, falling back to the local encoder.
    Sidecar,
}

/// The tokenizer sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerSettings {
    pub program: String,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub http_timeout_ms: u64,
    /// Extra attempts after a connection failure.
    pub retries: u32,
    pub startup_timeout_ms: u64,
    pub pid_file: Option<String>,
    /// Template name forwarded to `/chat_template`.
    pub template: Option<String>,
    pub template_source: TemplateSource,
}

impl Default for TokenizerSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["qwen2.5_tokenizer.py".to_string()],
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TOKENIZER_PORT,
            http_timeout_ms: 5_000,
            retries: 1,
            startup_timeout_ms: 30_000,
            pid_file: None,
            template: None,
            template_source: TemplateSource::Local,
        }
    }
}

impl TokenizerSettings {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Restart and probing policy shared by both supervised processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub healthy_reset_ms: u64,
    pub max_consecutive_restarts: u32,
    pub probe_interval_ms: u64,
    /// Consecutive probe failures that count as a crash.
    pub probe_failure_threshold: u32,
    pub stop_grace_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            healthy_reset_ms: 60_000,
            max_consecutive_restarts: 5,
            probe_interval_ms: 10_000,
            probe_failure_threshold: 3,
            stop_grace_ms: 15_000,
        }
    }
}

impl SupervisorSettings {
    pub const fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            healthy_reset_after: Duration::from_millis(self.healthy_reset_ms),
            max_consecutive_restarts: self.max_consecutive_restarts,
        }
    }

    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Admission limits for generation requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_in_flight: usize,
    /// Requests allowed to wait behind the in-flight ones.
    pub capacity: usize,
    pub request_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            capacity: 8,
            request_timeout_ms: 120_000,
        }
    }
}

impl QueueSettings {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Sampling defaults applied to unset completion options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub repeat_penalty: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            max_tokens: 512,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Settings validation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} program path cannot be empty")]
    EmptyProgram(&'static str),

    #[error("Terminal marker cannot be empty")]
    EmptyTerminalMarker,

    #[error("Max in-flight requests must be at least 1")]
    ZeroInFlight,

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("Backoff base ({base_ms}ms) exceeds the cap ({cap_ms}ms)")]
    BackoffBaseAboveCap { base_ms: u64, cap_ms: u64 },

    #[error("Port should be >= 1024 (privileged ports require root), got {0}")]
    InvalidPort(u16),

    #[error("Tokenizer host must be a loopback address, got {0}")]
    NonLoopbackHost(String),

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

/// Validate settings values.
pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if settings.model.program.trim().is_empty() {
        return Err(SettingsError::EmptyProgram("Model"));
    }
    if settings.tokenizer.program.trim().is_empty() {
        return Err(SettingsError::EmptyProgram("Tokenizer"));
    }
    if settings.model.terminal_marker.trim().is_empty() {
        return Err(SettingsError::EmptyTerminalMarker);
    }
    if settings.queue.max_in_flight == 0 {
        return Err(SettingsError::ZeroInFlight);
    }

    let timeouts = [
        ("Model startup timeout", settings.model.startup_timeout_ms),
        ("Model response timeout", settings.model.response_timeout_ms),
        ("Tokenizer HTTP timeout", settings.tokenizer.http_timeout_ms),
        ("Tokenizer startup timeout", settings.tokenizer.startup_timeout_ms),
        ("Request timeout", settings.queue.request_timeout_ms),
        ("Probe interval", settings.supervisor.probe_interval_ms),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
        return Err(SettingsError::ZeroTimeout(name));
    }

    let sup = &settings.supervisor;
    if sup.backoff_base_ms > sup.backoff_cap_ms {
        return Err(SettingsError::BackoffBaseAboveCap {
            base_ms: sup.backoff_base_ms,
            cap_ms: sup.backoff_cap_ms,
        });
    }

    if settings.tokenizer.port < 1024 {
        return Err(SettingsError::InvalidPort(settings.tokenizer.port));
    }

    let host = settings.tokenizer.host.trim();
    let loopback = host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback());
    if !loopback {
        return Err(SettingsError::NonLoopbackHost(host.to_string()));
    }

    Ok(())
}
