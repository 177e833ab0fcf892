//! Shared helpers for runtime integration tests.
//!
//! The model runner is played by small `sh` scripts speaking the same
//! line protocol: banner, ready line, then `prompt >> ` before every input.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qfacade_core::{ProbeContext, ProbeOutcome, RestartPolicy};
use qfacade_runtime::{
    LaunchSpec, OutputPatternProbe, ProcessLogBuffer, ProcessSupervisor, SupervisorConfig,
};

pub const MARKER: &str = "prompt >>";

/// Interactive runner: answers 2+2, crashes on `crash`, exits on `q`.
pub const RUNNER_SCRIPT: &str = r#"
echo "loading weights"
echo "LLM init ok"
printf 'prompt >> '
while IFS= read -r line; do
  case "$line" in
    q) exit 0 ;;
    crash) echo "segfault imminent"; exit 3 ;;
    *"2+2"*) echo "hello"; echo "the answer is 4" ;;
    *) echo "you said: $line" ;;
  esac
  printf 'prompt >> '
done
"#;

/// Runner that prints noise before it is ready.
pub const NOISY_RUNNER_SCRIPT: &str = r#"
echo "Welcome to the runner"
echo "banner line 2"
echo "stale output from nowhere"
printf 'prompt >> '
while IFS= read -r line; do
  [ "$line" = "q" ] && exit 0
  echo "reply to $line"
  printf 'prompt >> '
done
"#;

/// Runner that dies right after starting.
pub const CRASHING_SCRIPT: &str = "echo 'starting'; exit 1";

pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        restart_policy: RestartPolicy {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
            healthy_reset_after: Duration::from_secs(60),
            max_consecutive_restarts: 3,
        },
        probe_interval: Duration::from_millis(100),
        probe_failure_threshold: 3,
        startup_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        restart_on_response_timeout: false,
        terminal_marker: Some(MARKER.to_string()),
    }
}

/// Supervisor for an `sh -c script` runner, ready once `patterns` appear.
pub fn runner(script: &str, patterns: &[&str], config: SupervisorConfig) -> Arc<ProcessSupervisor> {
    let logs = Arc::new(ProcessLogBuffer::new());
    let probe = OutputPatternProbe::new(
        Arc::clone(&logs),
        patterns.iter().map(ToString::to_string).collect(),
    );
    let spec = LaunchSpec::new("model", "sh")
        .with_args(["-c", script])
        .with_quit_command("q");
    Arc::new(ProcessSupervisor::new(spec, config, Arc::new(probe), logs))
}

/// Probe that never succeeds.
pub struct NeverReady;

#[async_trait]
impl qfacade_core::HealthProbe for NeverReady {
    async fn probe(&self, _ctx: &ProbeContext) -> ProbeOutcome {
        ProbeOutcome::unhealthy("never ready")
    }
}
