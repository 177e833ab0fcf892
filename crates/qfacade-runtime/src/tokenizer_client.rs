//! HTTP client for the tokenizer sidecar.
//!
//! Loopback only. Every call is refused locally while the sidecar is not
//! ready, retried on connection failures only, and never retried once the
//! sidecar answered with an error status.

use std::time::Duration;

use async_trait::async_trait;
use qfacade_core::{ConversationTurn, FacadeError, TokenizerPort, TokenizerSettings};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::health::check_http_health;
use crate::readiness::ReadinessGate;

/// Pause before retrying a refused connection.
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
struct EncodeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    #[serde(alias = "token_ids")]
    tokens: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct DecodeRequest<'a> {
    tokens: &'a [u32],
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    #[serde(alias = "decoded")]
    text: String,
}

#[derive(Debug, Serialize)]
struct TemplateRequest<'a> {
    messages: &'a [ConversationTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<&'a str>,
    add_generation_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct TemplateResponse {
    prompt: String,
}

/// Client for `/encode`, `/decode`, `/chat_template` and `/health`.
pub struct TokenizerSidecarClient {
    client: Client,
    base_url: String,
    retries: u32,
    gate: ReadinessGate,
}

impl TokenizerSidecarClient {
    /// `gate` should track the tokenizer process only.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        retries: u32,
        gate: ReadinessGate,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retries,
            gate,
        })
    }

    pub fn from_settings(
        settings: &TokenizerSettings,
        gate: ReadinessGate,
    ) -> Result<Self, reqwest::Error> {
        Self::new(
            settings.base_url(),
            settings.http_timeout(),
            settings.retries,
            gate,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether `GET /health` answers with success. Not gated.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match check_http_health(&self.client, &url).await {
            Ok(()) => true,
            Err(reason) => {
                debug!(url = %url, %reason, "Tokenizer health check failed");
                false
            }
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, FacadeError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        if !self.gate.is_ready() {
            let state = self
                .gate
                .states()
                .into_iter()
                .map(|(name, state)| format!("{name} is {state}"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(FacadeError::TokenizerUnavailable(format!(
                "sidecar not ready ({state})"
            )));
        }

        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        loop {
            let response = match self.client.post(&url).json(body).send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() && attempt < self.retries => {
                    attempt += 1;
                    warn!(path, attempt, error = %e, "Tokenizer connection failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    warn!(path, error = %e, "Tokenizer request failed");
                    return Err(FacadeError::TokenizerUnavailable(format!("{path}: {e}")));
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(path, %status, "Tokenizer returned an error");
                return Err(FacadeError::TokenizerUnavailable(format!(
                    "{path} returned {status}: {}",
                    body.trim()
                )));
            }

            return response.json::<R>().await.map_err(|e| {
                FacadeError::TokenizerUnavailable(format!("{path}: invalid response: {e}"))
            });
        }
    }
}

#[async_trait]
impl TokenizerPort for TokenizerSidecarClient {
    async fn encode(&self, text: &str) -> Result<Vec<u32>, FacadeError> {
        let response: EncodeResponse = self.post("/encode", &EncodeRequest { text }).await?;
        Ok(response.tokens)
    }

    async fn decode(&self, tokens: &[u32]) -> Result<String, FacadeError> {
        let response: DecodeResponse = self.post("/decode", &DecodeRequest { tokens }).await?;
        Ok(response.text)
    }

    async fn apply_template(
        &self,
        turns: &[ConversationTurn],
        template: Option<&str>,
    ) -> Result<String, FacadeError> {
        let request = TemplateRequest {
            messages: turns,
            template,
            add_generation_prompt: true,
        };
        let response: TemplateResponse = self.post("/chat_template", &request).await?;
        Ok(response.prompt)
    }
}
