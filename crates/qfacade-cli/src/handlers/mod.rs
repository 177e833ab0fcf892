//! Command handlers.
//!
//! Each handler boots what it needs, does one thing and shuts down. Answers and
//! JSON go to stdout; everything else is logged to stderr.

pub mod ask;
pub mod chat;
pub mod check_config;
pub mod health;

use qfacade_core::{Completion, ConversationTurn};

/// Conversation opened by an optional system prompt.
pub(crate) fn opening_turns(system: Option<String>) -> Vec<ConversationTurn> {
    system
        .filter(|s| !s.trim().is_empty())
        .map(ConversationTurn::system)
        .into_iter()
        .collect()
}

pub(crate) fn usage_line(completion: &Completion) -> String {
    format!(
        "[{} | {} prompt + {} completion = {} tokens]",
        completion.id,
        completion.prompt_token_count,
        completion.completion_token_count,
        completion.total_tokens()
    )
}
