//! Aggregate readiness of supervised processes.

use std::collections::BTreeMap;

use qfacade_core::{FacadeError, HealthState, ProcessHealth};
use tokio::sync::watch;

/// Ready iff every tracked process is `Ready`.
///
/// Reads the supervisors' published health; cloning is cheap and shares the
/// same sources.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    processes: Vec<(String, watch::Receiver<ProcessHealth>)>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_process(
        mut self,
        name: impl Into<String>,
        health: watch::Receiver<ProcessHealth>,
    ) -> Self {
        self.processes.push((name.into(), health));
        self
    }

    /// A gate tracking only `name`, if it is tracked here.
    pub fn only(&self, name: &str) -> Option<Self> {
        self.processes
            .iter()
            .find(|(n, _)| n == name)
            .map(|entry| Self {
                processes: vec![entry.clone()],
            })
    }

    /// An empty gate is never ready.
    pub fn is_ready(&self) -> bool {
        !self.processes.is_empty() && self.processes.iter().all(|(_, rx)| rx.borrow().is_ready())
    }

    pub fn is_process_ready(&self, name: &str) -> bool {
        self.process(name).is_some_and(|h| h.is_ready())
    }

    pub fn process(&self, name: &str) -> Option<ProcessHealth> {
        self.processes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rx)| rx.borrow().clone())
    }

    pub fn states(&self) -> BTreeMap<String, HealthState> {
        self.processes
            .iter()
            .map(|(name, rx)| (name.clone(), rx.borrow().state))
            .collect()
    }

    pub fn detail(&self) -> BTreeMap<String, ProcessHealth> {
        self.processes
            .iter()
            .map(|(name, rx)| (name.clone(), rx.borrow().clone()))
            .collect()
    }

    /// Fail fast with `NotReady` unless every process is ready.
    pub fn check(&self) -> Result<(), FacadeError> {
        if self.processes.is_empty() {
            return Err(FacadeError::not_ready("no processes are tracked"));
        }
        if self.is_ready() {
            return Ok(());
        }

        let detail = self
            .detail()
            .into_iter()
            .filter(|(_, h)| !h.is_ready())
            .map(|(name, h)| {
                if h.fatal {
                    format!("{name} is {} (fatal, not restarting)", h.state)
                } else {
                    format!("{name} is {}", h.state)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        Err(FacadeError::not_ready(detail))
    }
}
