//! Health probe port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a probe is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeContext {
    /// Supervised process name.
    pub name: String,
    /// Incarnation being probed.
    pub epoch: u64,
    pub pid: Option<u32>,
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { reason: String },
}

impl ProbeOutcome {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Readiness/health check for one supervised process.
///
/// Liveness (has the child exited) is the supervisor's job; a probe only
/// answers whether a live child can serve requests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, ctx: &ProbeContext) -> ProbeOutcome;
}
