//! Tokenizer port.
//!
//! The tokenizer is a black box reached over loopback HTTP. Every method
//! fails with [`FacadeError::TokenizerUnavailable`] when the sidecar is not
//! ready or the call fails after its retry.

use async_trait::async_trait;

use crate::domain::ConversationTurn;
use crate::error::FacadeError;

#[async_trait]
pub trait TokenizerPort: Send + Sync {
    /// Token ids for `text`.
    async fn encode(&self, text: &str) -> Result<Vec<u32>, FacadeError>;

    /// Text for `tokens`.
    async fn decode(&self, tokens: &[u32]) -> Result<String, FacadeError>;

    /// Render `turns` with the sidecar's chat template, ending with an open
    /// assistant turn.
    async fn apply_template(
        &self,
        turns: &[ConversationTurn],
        template: Option<&str>,
    ) -> Result<String, FacadeError>;
}
