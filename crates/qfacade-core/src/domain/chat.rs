//! Chat domain types.
//!
//! These types represent a conversation submitted for completion and the
//! completion handed back, independent of any transport concerns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::settings::GenerationDefaults;

/// Role of a single conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    /// Wire name used in prompts and tokenizer payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a role name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

/// Caller-supplied sampling options. Unset fields fall back to the
/// configured generation defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub repeat_penalty: Option<f32>,
}

impl CompletionOptions {
    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum number of tokens to generate.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Fill every unset option from `defaults`.
    #[must_use]
    pub fn resolve(&self, defaults: &GenerationDefaults) -> ResolvedOptions {
        ResolvedOptions {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            repeat_penalty: self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
        }
    }
}

/// Sampling options with every field decided.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub repeat_penalty: f32,
}

/// Result of a successful chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// Response id (`chatcmpl-` followed by 8 hex digits).
    pub id: String,
    /// Unix timestamp (seconds) when the completion finished.
    pub created: i64,
    /// Configured model name.
    pub model: String,
    /// Assistant text extracted from the model runner.
    pub text: String,
    pub prompt_token_count: usize,
    pub completion_token_count: usize,
    /// Options the request resolved to.
    pub options: ResolvedOptions,
    pub finish_reason: String,
}

impl Completion {
    /// Sum of prompt and completion tokens.
    #[must_use]
    pub const fn total_tokens(&self) -> usize {
        self.prompt_token_count + self.completion_token_count
    }
}
