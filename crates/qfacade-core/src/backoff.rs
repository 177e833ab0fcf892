//! Restart backoff policy.
//!
//! Pure timing logic for crash recovery. The supervisor reports crashes and
//! healthy observations with the current `Instant`; the tracker answers with
//! how long to wait before the next spawn, or that it should give up.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Exponential restart schedule with a cap and a healthy-period reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Continuous `Ready` time after which the schedule starts over.
    pub healthy_reset_after: Duration,
    /// Restarts allowed in a row before giving up for good.
    pub max_consecutive_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            healthy_reset_after: Duration::from_secs(60),
            max_consecutive_restarts: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Wait `delay`, then spawn again.
    Restart { attempt: u32, delay: Duration },
    /// Budget exhausted after `attempts` restarts in a row.
    GiveUp { attempts: u32 },
}

/// Consecutive-crash bookkeeping for one supervised process.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    policy: RestartPolicy,
    consecutive: u32,
    healthy_since: Option<Instant>,
}

impl BackoffTracker {
    pub const fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            healthy_since: None,
        }
    }

    pub const fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Restarts performed since the last reset.
    pub const fn consecutive_restarts(&self) -> u32 {
        self.consecutive
    }

    /// Record a crash observed at `now`.
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        self.apply_reset(now);
        self.healthy_since = None;

        if self.consecutive >= self.policy.max_consecutive_restarts {
            return RestartDecision::GiveUp {
                attempts: self.consecutive,
            };
        }

        self.consecutive += 1;
        RestartDecision::Restart {
            attempt: self.consecutive,
            delay: self.policy.delay_for(self.consecutive),
        }
    }

    /// Record that the process is `Ready` at `now`.
    ///
    /// The first call after a crash starts the healthy period; later calls
    /// reset the schedule once the period is long enough.
    pub fn on_healthy(&mut self, now: Instant) {
        if self.healthy_since.is_none() {
            self.healthy_since = Some(now);
        }
        self.apply_reset(now);
    }

    /// Record that health was interrupted (probe failure, degraded).
    pub const fn on_unhealthy(&mut self) {
        self.healthy_since = None;
    }

    /// Forget every crash, e.g. after an operator restart.
    pub const fn reset(&mut self) {
        self.consecutive = 0;
        self.healthy_since = None;
    }

    fn apply_reset(&mut self, now: Instant) {
        if let Some(since) = self.healthy_since {
            if now.saturating_duration_since(since) >= self.policy.healthy_reset_after {
                self.consecutive = 0;
            }
        }
    }
}
