//! Chat completion over the supervised model runner.
//!
//! `complete` is the single operation the outer HTTP layer calls:
//!
//! 1. Refuse while the readiness gate is closed.
//! 2. Render the conversation into one prompt.
//! 3. Admit through the request serializer, checking the gate again on
//!    admission.
//! 4. Exchange the prompt with the runner via the stream correlator.
//! 5. Count tokens and wrap the text in a [`Completion`].

use std::sync::Arc;

use chrono::Utc;
use qfacade_core::{
    ChatTemplate, Completion, CompletionOptions, ConversationTurn, FacadeError,
    GenerationDefaults, HealthSnapshot, ProcessHealth, TemplateSource, TokenizerPort,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::correlator::StreamCorrelator;
use crate::process::{MODEL_PROCESS, TOKENIZER_PROCESS};
use crate::readiness::ReadinessGate;
use crate::serializer::RequestSerializer;

pub struct ChatCompletionOrchestrator {
    gate: ReadinessGate,
    tokenizer: Arc<dyn TokenizerPort>,
    serializer: Arc<RequestSerializer>,
    correlator: Arc<StreamCorrelator>,
    template: ChatTemplate,
    template_source: TemplateSource,
    template_name: Option<String>,
    generation: GenerationDefaults,
    model_name: String,
}

impl ChatCompletionOrchestrator {
    pub fn new(
        gate: ReadinessGate,
        tokenizer: Arc<dyn TokenizerPort>,
        serializer: Arc<RequestSerializer>,
        correlator: Arc<StreamCorrelator>,
    ) -> Self {
        Self {
            gate,
            tokenizer,
            serializer,
            correlator,
            template: ChatTemplate::chatml(),
            template_source: TemplateSource::Local,
            template_name: None,
            generation: GenerationDefaults::default(),
            model_name: MODEL_PROCESS.to_string(),
        }
    }

    #[must_use]
    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = template;
        self
    }

    /// Render prompts through the tokenizer's `/chat_template` instead of the
    /// local encoder, using the named template if given.
    #[must_use]
    pub fn with_template_source(mut self, source: TemplateSource, name: Option<String>) -> Self {
        self.template_source = source;
        self.template_name = name;
        self
    }

    #[must_use]
    pub const fn with_generation_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.generation = defaults;
        self
    }

    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub const fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    pub fn serializer(&self) -> &RequestSerializer {
        &self.serializer
    }

    /// Generate the assistant reply to `messages`.
    pub async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: CompletionOptions,
    ) -> Result<Completion, FacadeError> {
        self.gate.check()?;

        let started = Instant::now();
        let resolved = options.resolve(&self.generation);
        let prompt = self.render_prompt(messages).await?;
        let prompt_token_count = self.count_tokens(&prompt).await;

        let gate = &self.gate;
        let correlator = &self.correlator;
        let (request_id, exchange) = self
            .serializer
            .submit(|ticket| async move {
                // The runner may have crashed while this request was queued.
                gate.check()?;
                debug!(request_id = %ticket.id, "Sending prompt to model runner");
                let exchange = correlator.exchange(&prompt, ticket.deadline).await?;
                Ok((ticket.id, exchange))
            })
            .await?;

        let completion_token_count = self.count_tokens(&exchange.text).await;
        info!(
            request_id = %request_id,
            prompt_tokens = prompt_token_count,
            completion_tokens = completion_token_count,
            discarded = exchange.discarded,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Completion finished"
        );

        let hex = request_id.simple().to_string();
        Ok(Completion {
            id: format!("chatcmpl-{}", &hex[..8]),
            created: Utc::now().timestamp(),
            model: self.model_name.clone(),
            text: exchange.text,
            prompt_token_count,
            completion_token_count,
            options: resolved,
            finish_reason: "stop".to_string(),
        })
    }

    /// Token count of `text`, estimated as `chars / 4` when the tokenizer
    /// cannot answer.
    pub async fn count_tokens(&self, text: &str) -> usize {
        match self.tokenizer.encode(text).await {
            Ok(tokens) => tokens.len(),
            Err(e) => {
                let estimate = text.chars().count() / 4;
                warn!(error = %e, estimate, "Token count unavailable, using estimate");
                estimate
            }
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let health = |name: &str| {
            self.gate
                .process(name)
                .unwrap_or_else(|| ProcessHealth::stopped(name))
        };
        HealthSnapshot::new(health(TOKENIZER_PROCESS), health(MODEL_PROCESS))
    }

    async fn render_prompt(&self, turns: &[ConversationTurn]) -> Result<String, FacadeError> {
        match self.template_source {
            TemplateSource::Local => Ok(self.template.encode(turns)?),
            TemplateSource::Sidecar => {
                self.template.validate(turns)?;
                match self
                    .tokenizer
                    .apply_template(turns, self.template_name.as_deref())
                    .await
                {
                    Err(FacadeError::TokenizerUnavailable(reason)) => {
                        warn!(%reason, "Sidecar template unavailable, using local encoder");
                        Ok(self.template.encode(turns)?)
                    }
                    other => other,
                }
            }
        }
    }
}
