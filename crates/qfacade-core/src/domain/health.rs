//! Process health states and the lifecycle state machine.
//!
//! Transitions are pure: the supervisor feeds [`LifecycleEvent`]s in and
//! publishes whatever state comes out. Nothing here touches a process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Health of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not running (initial state, or stopped on request).
    Stopped,
    /// Spawned, waiting for the first successful probe.
    Starting,
    /// Probes succeed; requests may be sent.
    Ready,
    /// Alive but the latest probe failed.
    Degraded,
    /// Exited or failed too many probes.
    Crashed,
}

/// Input to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A child process was spawned.
    Spawned,
    /// A health probe succeeded.
    ProbeSucceeded,
    /// A health probe failed. `threshold_reached` is set once the
    /// consecutive failure budget (or the startup timeout) is exhausted.
    ProbeFailed { threshold_reached: bool },
    /// The child exited.
    Exited,
    /// A new incarnation is about to be spawned (crash recovery or
    /// operator restart).
    Restarting,
    /// Stop was requested.
    Stop,
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition: {event:?} in state {from}")]
pub struct TransitionError {
    pub from: HealthState,
    pub event: LifecycleEvent,
}

impl HealthState {
    /// Apply `event` and return the next state.
    pub const fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use HealthState::{Crashed, Degraded, Ready, Starting, Stopped};
        use LifecycleEvent::{Exited, ProbeFailed, ProbeSucceeded, Restarting, Spawned, Stop};

        let next = match (self, event) {
            (_, Stop) => Stopped,
            (Stopped, Spawned) => Starting,
            (Starting, ProbeSucceeded) | (Ready | Degraded, ProbeSucceeded) => Ready,
            (Starting, ProbeFailed { threshold_reached: false }) => Starting,
            (Ready | Degraded, ProbeFailed { threshold_reached: false }) => Degraded,
            (Starting | Ready | Degraded, ProbeFailed { threshold_reached: true }) => Crashed,
            (Starting | Ready | Degraded | Crashed, Exited) => Crashed,
            (Starting | Ready | Degraded | Crashed, Restarting) => Starting,
            (Starting, Spawned) => Starting,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Whether requests may be sent to the process.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Published health of one supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHealth {
    pub name: String,
    pub state: HealthState,
    /// Restarts performed by the supervisor since it was started.
    pub restart_count: u32,
    pub consecutive_probe_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Incarnation counter; incremented on every spawn.
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Restart budget exhausted; the supervisor will not try again.
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProcessHealth {
    /// Initial health of a process that has not been started.
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: HealthState::Stopped,
            restart_count: 0,
            consecutive_probe_failures: 0,
            pid: None,
            epoch: 0,
            last_health_check: None,
            fatal: false,
            last_error: None,
        }
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

/// Aggregate health exposed to the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub tokenizer_state: ProcessHealth,
    pub model_state: ProcessHealth,
    pub overall_ready: bool,
    /// At least one process gave up restarting.
    pub fatal: bool,
}

impl HealthSnapshot {
    pub fn new(tokenizer_state: ProcessHealth, model_state: ProcessHealth) -> Self {
        let overall_ready = tokenizer_state.is_ready() && model_state.is_ready();
        let fatal = tokenizer_state.fatal || model_state.fatal;
        Self {
            tokenizer_state,
            model_state,
            overall_ready,
            fatal,
        }
    }

    /// Coarse status string: `ok`, `degraded`, `down` or `fatal`.
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.fatal {
            "fatal"
        } else if self.overall_ready {
            "ok"
        } else if matches!(
            (self.tokenizer_state.state, self.model_state.state),
            (HealthState::Stopped, HealthState::Stopped)
        ) {
            "down"
        } else {
            "degraded"
        }
    }
}
