//! Supervision of one long-lived child process.
//!
//! A `ProcessSupervisor` owns its child exclusively. A monitor task holds the
//! `Child`, drives the lifecycle state machine and publishes every change on a
//! `watch` channel; everyone else reads health from there. The child's stdout
//! is fanned out on a `broadcast` channel so readers never block the child.
//!
//! Key behaviours:
//! - **Startup**: probe until ready, the startup timeout, or exit.
//! - **Steady state**: periodic probes; failures degrade, enough in a row crash.
//! - **Crash recovery**: exponential backoff with a cap and a healthy-period
//!   reset; after the restart budget the process is marked fatal for good.
//! - **Stop**: two-phase (quit line, then signals to the process group) and
//!   terminal for the supervisor instance.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use qfacade_core::ports::{HealthProbe, OutputStream, ProbeContext, ProbeOutcome};
use qfacade_core::{
    BackoffTracker, FacadeError, HealthState, LifecycleEvent, ProcessError, ProcessHealth,
    RestartDecision, RestartPolicy, SupervisorSettings,
};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::correlator::LineChannel;
use crate::pidfile::{delete_pidfile, write_pidfile};
use crate::process::{
    LaunchSpec, OutputEvent, ProcessLogBuffer, StreamReader, shutdown_child, spawn,
};

/// Lines buffered for slow output subscribers before they start lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Probe cadence while waiting for a fresh incarnation to become ready.
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Timing and probing policy for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub restart_policy: RestartPolicy,
    pub probe_interval: Duration,
    /// Consecutive probe failures that count as a crash.
    pub probe_failure_threshold: u32,
    pub startup_timeout: Duration,
    /// Grace used when stopping for a restart.
    pub stop_grace: Duration,
    /// Restart the child when a response never terminates.
    pub restart_on_response_timeout: bool,
    /// Flush partial stdout lines ending with this marker.
    pub terminal_marker: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::default(),
            probe_interval: Duration::from_secs(10),
            probe_failure_threshold: 3,
            startup_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(15),
            restart_on_response_timeout: false,
            terminal_marker: None,
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &SupervisorSettings, startup_timeout: Duration) -> Self {
        Self {
            restart_policy: settings.restart_policy(),
            probe_interval: settings.probe_interval(),
            probe_failure_threshold: settings.probe_failure_threshold.max(1),
            startup_timeout,
            stop_grace: settings.stop_grace(),
            restart_on_response_timeout: false,
            terminal_marker: None,
        }
    }

    #[must_use]
    pub fn with_terminal_marker(mut self, marker: impl Into<String>) -> Self {
        self.terminal_marker = Some(marker.into());
        self
    }

    #[must_use]
    pub const fn with_restart_on_response_timeout(mut self, enabled: bool) -> Self {
        self.restart_on_response_timeout = enabled;
        self
    }
}

struct StdinSlot {
    epoch: u64,
    stdin: ChildStdin,
}

struct Incarnation {
    child: Child,
    epoch: u64,
    pid: Option<u32>,
}

/// How an incarnation ended.
enum Ended {
    /// Stop requested; the child has been shut down.
    Stopped,
    /// Operator restart; the child has been shut down.
    Restart,
    /// The child is gone (exited, or killed after failing probes).
    Crashed(String),
}

struct Shared {
    name: Arc<str>,
    spec: LaunchSpec,
    config: SupervisorConfig,
    probe: Arc<dyn HealthProbe>,
    logs: Arc<ProcessLogBuffer>,
    health: watch::Sender<ProcessHealth>,
    output: broadcast::Sender<OutputEvent>,
    stdin: Mutex<Option<StdinSlot>>,
    backoff: StdMutex<BackoffTracker>,
    stop_grace: StdMutex<Duration>,
    restart: Notify,
    verify: Notify,
    /// Epoch the pending verification is for; 0 when none.
    verify_epoch: AtomicU64,
    cancel: CancellationToken,
}

/// Lifecycle manager for one external child process.
///
/// # Example
///
/// ```ignore
/// let supervisor = ProcessSupervisor::new(spec, config, probe, logs);
/// supervisor.start().await?;
/// supervisor.wait_ready(Duration::from_secs(60)).await?;
/// supervisor.stop(Duration::from_secs(15)).await?;
/// ```
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(
        spec: LaunchSpec,
        config: SupervisorConfig,
        probe: Arc<dyn HealthProbe>,
        logs: Arc<ProcessLogBuffer>,
    ) -> Self {
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let (health, _) = watch::channel(ProcessHealth::stopped(spec.name.clone()));
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let backoff = BackoffTracker::new(config.restart_policy);
        let stop_grace = config.stop_grace;

        Self {
            shared: Arc::new(Shared {
                name,
                spec,
                config,
                probe,
                logs,
                health,
                output,
                stdin: Mutex::new(None),
                backoff: StdMutex::new(backoff),
                stop_grace: StdMutex::new(stop_grace),
                restart: Notify::new(),
                verify: Notify::new(),
                verify_epoch: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            monitor: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Captured output of every incarnation.
    pub fn logs(&self) -> Arc<ProcessLogBuffer> {
        Arc::clone(&self.shared.logs)
    }

    /// Current health.
    pub fn health(&self) -> ProcessHealth {
        self.shared.health.borrow().clone()
    }

    /// Health updates, for readiness gates.
    pub fn health_receiver(&self) -> watch::Receiver<ProcessHealth> {
        self.shared.health.subscribe()
    }

    /// Stdout lines of every incarnation from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.shared.output.subscribe()
    }

    /// Spawn the child and begin supervising it.
    ///
    /// Spawn failures surface here; later ones are treated as crashes.
    pub async fn start(&self) -> Result<(), ProcessError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ProcessError::Terminated(self.name().to_string()));
        }

        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(process = %self.name(), "Supervisor already running");
            return Ok(());
        }

        let first = self.shared.spawn_incarnation(false).await?;
        let shared = Arc::clone(&self.shared);
        *monitor = Some(tokio::spawn(shared.run(first)));
        Ok(())
    }

    /// Stop the child (quit line, then signals) and end supervision.
    ///
    /// The supervisor cannot be started again afterwards.
    pub async fn stop(&self, grace: Duration) -> Result<(), ProcessError> {
        self.terminated.store(true, Ordering::SeqCst);
        *self
            .shared
            .stop_grace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = grace;
        self.shared.cancel.cancel();

        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| {
                ProcessError::StopFailed(format!("{}: monitor task failed: {e}", self.name()))
            })?;
        }

        self.shared.publish(Some(LifecycleEvent::Stop), |h| h.pid = None);
        Ok(())
    }

    /// Probe now and return the resulting state.
    ///
    /// An on-demand probe can degrade the process but never crashes it;
    /// escalation stays with the periodic monitor.
    pub async fn health_check(&self) -> HealthState {
        let (state, ctx) = {
            let h = self.shared.health.borrow();
            (h.state, self.shared.probe_context(h.epoch, h.pid))
        };
        if !matches!(
            state,
            HealthState::Starting | HealthState::Ready | HealthState::Degraded
        ) {
            return state;
        }

        let outcome = self.shared.probe.probe(&ctx).await;
        if self.shared.health.borrow().epoch == ctx.epoch {
            self.shared.record_probe(&outcome, false);
        }
        self.shared.health.borrow().state
    }

    /// Stop the current child gracefully and spawn a fresh one.
    ///
    /// Operator restarts do not count against the crash budget and revive a
    /// supervisor that gave up.
    pub async fn restart(&self) -> Result<(), ProcessError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ProcessError::Terminated(self.name().to_string()));
        }
        let monitor = self.monitor.lock().await;
        if !monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ProcessError::NotRunning(self.name().to_string()));
        }

        info!(process = %self.name(), "Restart requested");
        self.shared.restart.notify_one();
        Ok(())
    }

    /// Ask the monitor to re-check incarnation `epoch` after a response
    /// timed out.
    ///
    /// Requests for any other incarnation are dropped by the monitor.
    pub fn request_verification(&self, epoch: u64) {
        debug!(process = %self.name(), epoch, "Verification requested");
        self.shared.verify_epoch.store(epoch, Ordering::SeqCst);
        self.shared.verify.notify_one();
    }

    /// Wait until the process is `Ready`.
    ///
    /// Fails with `RestartExhausted` once the process is fatal and with
    /// `NotReady` on timeout or after a stop.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), FacadeError> {
        self.wait_ready_since(0, timeout).await
    }

    /// Like [`wait_ready`](Self::wait_ready), but only an incarnation newer
    /// than `epoch` counts.
    pub async fn wait_ready_since(&self, epoch: u64, timeout: Duration) -> Result<(), FacadeError> {
        let mut rx = self.shared.health.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|h| {
                (h.epoch > epoch && (h.is_ready() || h.fatal))
                    || (h.state == HealthState::Stopped && self.terminated.load(Ordering::SeqCst))
            }),
        )
        .await;

        let health = match waited {
            Ok(Ok(h)) => ProcessHealth::clone(&h),
            Ok(Err(_)) => {
                return Err(FacadeError::not_ready(format!(
                    "{}: supervisor dropped",
                    self.name()
                )));
            }
            Err(_) => {
                let h = self.health();
                return Err(FacadeError::not_ready(format!(
                    "{}: not ready within {timeout:?} (state {})",
                    h.name, h.state
                )));
            }
        };

        if health.is_ready() {
            Ok(())
        } else if health.fatal {
            Err(FacadeError::RestartExhausted {
                name: health.name,
                attempts: self.shared.backoff().consecutive_restarts(),
            })
        } else {
            Err(FacadeError::not_ready(format!(
                "{}: {}",
                health.name, health.state
            )))
        }
    }

    /// Write one line to the child's stdin.
    ///
    /// Returns the epoch of the incarnation that received it.
    pub async fn write_line(&self, line: &str) -> Result<u64, FacadeError> {
        let mut slot = self.shared.stdin.lock().await;
        let Some(slot) = slot.as_mut() else {
            return Err(FacadeError::crashed(self.name(), "stdin is not available"));
        };

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let written = async {
            slot.stdin.write_all(&bytes).await?;
            slot.stdin.flush().await
        }
        .await;

        written
            .map(|()| slot.epoch)
            .map_err(|e| FacadeError::crashed(self.name(), format!("write to stdin failed: {e}")))
    }
}

impl Shared {
    fn backoff(&self) -> MutexGuard<'_, BackoffTracker> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace(&self) -> Duration {
        *self.stop_grace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe_context(&self, epoch: u64, pid: Option<u32>) -> ProbeContext {
        ProbeContext {
            name: self.name.to_string(),
            epoch,
            pid,
        }
    }

    /// Apply `event` (if any) and `update` as a single health change.
    fn publish(&self, event: Option<LifecycleEvent>, update: impl FnOnce(&mut ProcessHealth)) {
        self.health.send_modify(|h| {
            if let Some(event) = event {
                match h.state.apply(event) {
                    Ok(next) if next != h.state => {
                        info!(process = %h.name, from = %h.state, to = %next, "State transition");
                        h.state = next;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(process = %h.name, error = %e, "Ignoring lifecycle event"),
                }
            }
            update(h);
        });
    }

    async fn spawn_incarnation(&self, restart: bool) -> Result<Incarnation, ProcessError> {
        let epoch = self.health.borrow().epoch + 1;

        let mut child = match spawn(&self.spec) {
            Ok(child) => child,
            Err(e) => {
                error!(process = %self.name, error = %e, "Failed to spawn process");
                self.publish(None, |h| h.last_error = Some(e.to_string()));
                return Err(e);
            }
        };
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            StreamReader {
                name: Arc::clone(&self.name),
                epoch,
                stream: OutputStream::Stdout,
                terminal_marker: self.config.terminal_marker.clone(),
                output: Some(self.output.clone()),
                sink: self.logs.clone(),
            }
            .spawn(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            StreamReader {
                name: Arc::clone(&self.name),
                epoch,
                stream: OutputStream::Stderr,
                terminal_marker: None,
                output: None,
                sink: self.logs.clone(),
            }
            .spawn(stderr);
        }
        *self.stdin.lock().await = child.stdin.take().map(|stdin| StdinSlot { epoch, stdin });

        if let (Some(path), Some(pid)) = (&self.spec.pid_file, pid) {
            if let Err(e) = write_pidfile(path, pid) {
                warn!(process = %self.name, path = %path.display(), error = %e, "Failed to write PID file");
            }
        }

        let event = if restart {
            LifecycleEvent::Restarting
        } else {
            LifecycleEvent::Spawned
        };
        self.publish(Some(event), |h| {
            h.epoch = epoch;
            h.pid = pid;
            h.consecutive_probe_failures = 0;
            h.last_error = None;
            if restart {
                h.restart_count += 1;
            }
        });

        info!(process = %self.name, pid = ?pid, epoch, "Process spawned");
        Ok(Incarnation { child, epoch, pid })
    }

    async fn run(self: Arc<Self>, first: Incarnation) {
        let mut current = Some(first);

        loop {
            let ended = match current.take() {
                Some(incarnation) => self.supervise(incarnation).await,
                None => Ended::Crashed("spawn failed".to_string()),
            };

            let reason = match ended {
                Ended::Stopped => break,
                Ended::Restart => {
                    self.backoff().reset();
                    current = self.respawn().await;
                    continue;
                }
                Ended::Crashed(reason) => reason,
            };

            let decision = self.backoff().on_crash(Instant::now().into_std());
            match decision {
                RestartDecision::Restart { attempt, delay } => {
                    warn!(
                        process = %self.name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %reason,
                        "Process crashed, restarting after backoff"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.restart.notified() => self.backoff().reset(),
                        () = sleep(delay) => {}
                    }
                }
                RestartDecision::GiveUp { attempts } => {
                    error!(process = %self.name, attempts, %reason, "Restart budget exhausted, giving up");
                    self.publish(None, |h| {
                        h.fatal = true;
                        h.last_error = Some(format!(
                            "gave up after {attempts} consecutive restarts: {reason}"
                        ));
                    });
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.restart.notified() => {
                            info!(process = %self.name, "Operator restart after giving up");
                            self.backoff().reset();
                            self.publish(None, |h| h.fatal = false);
                        }
                    }
                }
            }
            current = self.respawn().await;
        }

        self.publish(Some(LifecycleEvent::Stop), |h| h.pid = None);
        debug!(process = %self.name, "Monitor task exiting");
    }

    async fn respawn(&self) -> Option<Incarnation> {
        self.spawn_incarnation(true).await.ok()
    }

    async fn supervise(&self, mut inc: Incarnation) -> Ended {
        let ctx = self.probe_context(inc.epoch, inc.pid);

        let deadline = Instant::now() + self.config.startup_timeout;
        let mut poll = interval(STARTUP_POLL.min(self.config.probe_interval));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.shutdown(inc, Ended::Stopped).await,
                () = self.restart.notified() => return self.shutdown(inc, Ended::Restart).await,
                status = inc.child.wait() => return self.exited(&inc, status).await,
                _ = poll.tick() => {
                    let outcome = self.probe.probe(&ctx).await;
                    if outcome.is_healthy() {
                        self.record_probe(&outcome, false);
                        break;
                    }
                    if Instant::now() >= deadline {
                        let reason = format!("not ready within {:?}", self.config.startup_timeout);
                        warn!(process = %self.name, epoch = inc.epoch, %reason, "Startup timed out");
                        self.publish(
                            Some(LifecycleEvent::ProbeFailed { threshold_reached: true }),
                            |h| h.last_error = Some(reason.clone()),
                        );
                        return self.kill(inc, reason).await;
                    }
                }
            }
        }

        info!(process = %self.name, epoch = inc.epoch, pid = ?inc.pid, "Process ready");

        let period = self.config.probe_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.shutdown(inc, Ended::Stopped).await,
                () = self.restart.notified() => return self.shutdown(inc, Ended::Restart).await,
                status = inc.child.wait() => return self.exited(&inc, status).await,
                () = self.verify.notified() => {
                    let requested = self.verify_epoch.swap(0, Ordering::SeqCst);
                    if requested != inc.epoch {
                        debug!(process = %self.name, requested, epoch = inc.epoch, "Ignoring verification for another incarnation");
                        continue;
                    }
                    if self.config.restart_on_response_timeout {
                        let reason = "unresponsive after a response timeout".to_string();
                        warn!(process = %self.name, epoch = inc.epoch, "Restarting unresponsive process");
                        self.publish(
                            Some(LifecycleEvent::ProbeFailed { threshold_reached: true }),
                            |h| h.last_error = Some(reason.clone()),
                        );
                        return self.kill(inc, reason).await;
                    }
                    if let Some(reason) = self.observe(&ctx).await {
                        return self.kill(inc, reason).await;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(reason) = self.observe(&ctx).await {
                        return self.kill(inc, reason).await;
                    }
                }
            }
        }
    }

    /// Probe once; returns a crash reason when the failure threshold is hit.
    async fn observe(&self, ctx: &ProbeContext) -> Option<String> {
        let outcome = self.probe.probe(ctx).await;
        self.record_probe(&outcome, true)
    }

    fn record_probe(&self, outcome: &ProbeOutcome, may_crash: bool) -> Option<String> {
        match outcome {
            ProbeOutcome::Healthy => {
                self.backoff().on_healthy(Instant::now().into_std());
                self.publish(Some(LifecycleEvent::ProbeSucceeded), |h| {
                    h.consecutive_probe_failures = 0;
                    h.last_health_check = Some(Utc::now());
                });
                None
            }
            ProbeOutcome::Unhealthy { reason } => {
                self.backoff().on_unhealthy();
                let threshold = self.config.probe_failure_threshold;
                let failures = self.health.borrow().consecutive_probe_failures + 1;
                let threshold_reached = may_crash && failures >= threshold;

                warn!(process = %self.name, failures, threshold, %reason, "Health probe failed");
                self.publish(
                    Some(LifecycleEvent::ProbeFailed { threshold_reached }),
                    |h| {
                        h.consecutive_probe_failures = failures;
                        h.last_health_check = Some(Utc::now());
                        h.last_error = Some(reason.clone());
                    },
                );

                threshold_reached.then(|| format!("{failures} consecutive probe failures: {reason}"))
            }
        }
    }

    async fn exited(&self, inc: &Incarnation, status: io::Result<ExitStatus>) -> Ended {
        let reason = match status {
            Ok(status) => format!("exited with {status}"),
            Err(e) => format!("wait failed: {e}"),
        };
        warn!(process = %self.name, epoch = inc.epoch, pid = ?inc.pid, %reason, "Process exited unexpectedly");

        drop(self.take_stdin(inc.epoch).await);
        self.remove_pidfile();
        self.publish(Some(LifecycleEvent::Exited), |h| {
            h.pid = None;
            h.last_error = Some(reason.clone());
        });
        Ended::Crashed(reason)
    }

    /// Graceful stop for `Stopped` and `Restart` endings.
    async fn shutdown(&self, mut inc: Incarnation, ended: Ended) -> Ended {
        let stdin = self.take_stdin(inc.epoch).await;
        let grace = self.grace();
        match shutdown_child(&mut inc.child, stdin, self.spec.quit_command.as_deref(), grace).await
        {
            Ok(status) => info!(process = %self.name, pid = ?inc.pid, %status, "Process stopped"),
            Err(e) => warn!(process = %self.name, pid = ?inc.pid, error = %e, "Failed to stop process cleanly"),
        }
        self.remove_pidfile();
        ended
    }

    /// Forced stop of a live child that is considered crashed.
    async fn kill(&self, mut inc: Incarnation, reason: String) -> Ended {
        drop(self.take_stdin(inc.epoch).await);
        if let Err(e) = shutdown_child(&mut inc.child, None, None, Duration::ZERO).await {
            warn!(process = %self.name, pid = ?inc.pid, error = %e, "Failed to kill process");
        }
        self.remove_pidfile();
        self.publish(None, |h| h.pid = None);
        Ended::Crashed(reason)
    }

    async fn take_stdin(&self, epoch: u64) -> Option<ChildStdin> {
        let mut slot = self.stdin.lock().await;
        if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
            slot.take().map(|s| s.stdin)
        } else {
            None
        }
    }

    fn remove_pidfile(&self) {
        if let Some(path) = &self.spec.pid_file {
            if let Err(e) = delete_pidfile(path) {
                warn!(process = %self.name, path = %path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

#[async_trait]
impl LineChannel for ProcessSupervisor {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.subscribe_output()
    }

    async fn write_line(&self, line: &str) -> Result<u64, FacadeError> {
        Self::write_line(self, line).await
    }

    fn on_response_timeout(&self, epoch: u64) {
        self.request_verification(epoch);
    }
}
