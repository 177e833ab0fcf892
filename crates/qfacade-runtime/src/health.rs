//! Health probes for supervised processes.
//!
//! Probes only answer "can this incarnation serve requests". Whether the
//! child is still alive is observed by the supervisor waiting on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qfacade_core::ports::{HealthProbe, ProbeContext, ProbeOutcome};
use reqwest::Client;
use tracing::debug;

use crate::process::ProcessLogBuffer;

/// Check the HTTP health endpoint at `url`.
///
/// Returns `Ok(())` on a success status, otherwise a short reason.
pub async fn check_http_health(client: &Client, url: &str) -> Result<(), String> {
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(format!("health endpoint returned {}", response.status())),
        Err(e) if e.is_timeout() => Err("health check timeout".to_string()),
        Err(e) if e.is_connect() => Err("connection refused".to_string()),
        Err(e) => Err(format!("health check failed: {e}")),
    }
}

/// Ready once the current incarnation printed a ready pattern.
pub struct OutputPatternProbe {
    logs: Arc<ProcessLogBuffer>,
    patterns: Vec<String>,
}

impl OutputPatternProbe {
    /// `patterns` should include the terminal marker: a runner waiting for
    /// input is ready even if it printed none of the banner lines.
    pub const fn new(logs: Arc<ProcessLogBuffer>, patterns: Vec<String>) -> Self {
        Self { logs, patterns }
    }
}

#[async_trait]
impl HealthProbe for OutputPatternProbe {
    async fn probe(&self, ctx: &ProbeContext) -> ProbeOutcome {
        if self.logs.contains_any(ctx.epoch, &self.patterns) {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::unhealthy("no ready pattern in output yet")
        }
    }
}

/// Ready while `GET <url>` answers with a success status.
pub struct HttpHealthProbe {
    client: Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, ctx: &ProbeContext) -> ProbeOutcome {
        match check_http_health(&self.client, &self.url).await {
            Ok(()) => ProbeOutcome::Healthy,
            Err(reason) => {
                debug!(process = %ctx.name, epoch = ctx.epoch, url = %self.url, %reason, "HTTP probe failed");
                ProbeOutcome::Unhealthy { reason }
            }
        }
    }
}
