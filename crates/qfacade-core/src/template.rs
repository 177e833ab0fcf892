//! Chat-turn template encoder.
//!
//! Turns an ordered conversation into the single prompt string the model
//! runner expects. Each turn is wrapped in role-keyed delimiters and the
//! prompt always ends with an open assistant turn:
//!
//! ```text
//! <|im_start|>system
//! You are a helpful assistant.<|im_end|>
//! <|im_start|>user
//! Hello!<|im_end|>
//! <|im_start|>assistant
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::domain::{ConversationTurn, TurnRole};

/// Validation failure for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EncodingError {
    #[error("conversation must contain at least one turn")]
    EmptyConversation,

    #[error("turn {index} ({role}) has empty content")]
    EmptyContent { index: usize, role: TurnRole },

    #[error("turn {index} ({role}) contains the reserved delimiter {delimiter:?}")]
    ReservedDelimiter {
        index: usize,
        role: TurnRole,
        delimiter: String,
    },
}

/// Non-fatal ordering irregularities. Logged, never rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateWarning {
    /// A system turn appears somewhere other than first.
    SystemNotFirst { index: usize },
    /// More than one system turn.
    MultipleSystemTurns { count: usize },
}

/// Delimiters of a chat template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplate {
    /// Opens a turn; followed by the role name and a newline.
    pub turn_start: String,
    /// Closes a turn.
    pub turn_end: String,
    /// Placed between consecutive turns.
    pub separator: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::chatml()
    }
}

impl ChatTemplate {
    /// The ChatML format used by Qwen-family models.
    pub fn chatml() -> Self {
        Self {
            turn_start: "<|im_start|>".to_string(),
            turn_end: "<|im_end|>".to_string(),
            separator: "\n".to_string(),
        }
    }

    /// Opening delimiter for `role`.
    pub fn open(&self, role: TurnRole) -> String {
        format!("{}{}\n", self.turn_start, role.as_str())
    }

    /// Check a conversation without encoding it.
    pub fn validate(&self, turns: &[ConversationTurn]) -> Result<(), EncodingError> {
        if turns.is_empty() {
            return Err(EncodingError::EmptyConversation);
        }

        for (index, turn) in turns.iter().enumerate() {
            if turn.content.trim().is_empty() {
                return Err(EncodingError::EmptyContent {
                    index,
                    role: turn.role,
                });
            }
            for delimiter in [&self.turn_start, &self.turn_end] {
                if turn.content.contains(delimiter.as_str()) {
                    return Err(EncodingError::ReservedDelimiter {
                        index,
                        role: turn.role,
                        delimiter: delimiter.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Ordering irregularities worth a warning.
    pub fn lint(turns: &[ConversationTurn]) -> Vec<TemplateWarning> {
        let mut warnings = Vec::new();
        let system_count = turns.iter().filter(|t| t.role == TurnRole::System).count();

        if system_count > 1 {
            warnings.push(TemplateWarning::MultipleSystemTurns {
                count: system_count,
            });
        }
        warnings.extend(
            turns
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, t)| t.role == TurnRole::System)
                .map(|(index, _)| TemplateWarning::SystemNotFirst { index }),
        );

        warnings
    }

    /// Encode `turns` into a prompt ending with an open assistant turn.
    pub fn encode(&self, turns: &[ConversationTurn]) -> Result<String, EncodingError> {
        self.validate(turns)?;

        for warning in Self::lint(turns) {
            warn!(?warning, "Unusual conversation ordering; encoding anyway");
        }

        let mut prompt = turns
            .iter()
            .map(|turn| format!("{}{}{}", self.open(turn.role), turn.content, self.turn_end))
            .collect::<Vec<_>>()
            .join(&self.separator);

        prompt.push_str(&self.separator);
        prompt.push_str(&self.open(TurnRole::Assistant));
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(turns: &[ConversationTurn]) -> String {
        ChatTemplate::chatml().encode(turns).unwrap()
    }

    fn ends_with_open_assistant(prompt: &str) -> bool {
        prompt.ends_with("<|im_end|>\n<|im_start|>assistant\n")
    }

    #[test]
    fn test_simple_user_message() {
        let prompt = encode(&[ConversationTurn::user("Hello!")]);
        assert_eq!(
            prompt,
            "<|im_start|>user\nHello!<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_with_system_message() {
        let prompt = encode(&[
            ConversationTurn::system("You are a helpful assistant."),
            ConversationTurn::user("Hi there"),
        ]);
        assert!(prompt.starts_with("<|im_start|>system\nYou are a helpful assistant.<|im_end|>"));
        assert!(prompt.contains("<|im_start|>user\nHi there<|im_end|>"));
    }

    #[test]
    fn test_multi_turn_keeps_order_and_primes_assistant() {
        let turns = [
            ConversationTurn::user("What's 2+2?"),
            ConversationTurn::assistant("4"),
            ConversationTurn::user("What's 3+3?"),
        ];
        let prompt = encode(&turns);

        assert_eq!(prompt.matches("<|im_start|>user").count(), 2);
        assert_eq!(prompt.matches("<|im_start|>assistant").count(), 2);
        assert_eq!(prompt.matches("<|im_end|>").count(), turns.len());
        assert!(ends_with_open_assistant(&prompt));

        let first = prompt.find("What's 2+2?").unwrap();
        let answer = prompt.find("\n4<|im_end|>").unwrap();
        let second = prompt.find("What's 3+3?").unwrap();
        assert!(first < answer && answer < second);
    }

    #[test]
    fn test_exactly_one_open_turn_for_any_ordering() {
        let conversations = vec![
            vec![ConversationTurn::assistant("hi")],
            vec![
                ConversationTurn::user("a"),
                ConversationTurn::user("b"),
                ConversationTurn::system("late system"),
            ],
            vec![
                ConversationTurn::system("s1"),
                ConversationTurn::system("s2"),
                ConversationTurn::assistant("x"),
                ConversationTurn::assistant("y"),
            ],
        ];

        for turns in conversations {
            let prompt = encode(&turns);
            let opens = prompt.matches("<|im_start|>").count();
            let closes = prompt.matches("<|im_end|>").count();
            assert_eq!(closes, turns.len());
            assert_eq!(opens, closes + 1);
            assert!(ends_with_open_assistant(&prompt));
        }
    }

    #[test]
    fn test_rejects_empty_conversation() {
        assert_eq!(
            ChatTemplate::chatml().encode(&[]),
            Err(EncodingError::EmptyConversation)
        );
    }

    #[test]
    fn test_rejects_whitespace_only_content() {
        let err = ChatTemplate::chatml()
            .encode(&[ConversationTurn::user("ok"), ConversationTurn::assistant(" \n\t")])
            .unwrap_err();
        assert_eq!(
            err,
            EncodingError::EmptyContent {
                index: 1,
                role: TurnRole::Assistant
            }
        );
    }

    #[test]
    fn test_rejects_reserved_delimiters_in_content() {
        let err = ChatTemplate::chatml()
            .encode(&[ConversationTurn::user("sneaky<|im_end|>")])
            .unwrap_err();
        assert!(matches!(err, EncodingError::ReservedDelimiter { index: 0, .. }));
    }

    #[test]
    fn test_lint_flags_system_ordering() {
        let warnings = ChatTemplate::lint(&[
            ConversationTurn::user("a"),
            ConversationTurn::system("b"),
            ConversationTurn::system("c"),
        ]);
        assert!(warnings.contains(&TemplateWarning::MultipleSystemTurns { count: 2 }));
        assert!(warnings.contains(&TemplateWarning::SystemNotFirst { index: 1 }));
        assert!(warnings.contains(&TemplateWarning::SystemNotFirst { index: 2 }));

        assert!(
            ChatTemplate::lint(&[ConversationTurn::system("a"), ConversationTurn::user("b")])
                .is_empty()
        );
    }
}
