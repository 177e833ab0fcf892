//! Two-phase shutdown for supervised children.
//!
//! 1. Polite: write the quit command (if any), close stdin, wait up to the
//!    grace period.
//! 2. Forceful: SIGTERM to the whole process group, wait for whatever grace
//!    is left (at least one second), then SIGKILL to the group and reap.
//!
//! Non-Unix platforms skip straight from phase 1 to `Child::kill`.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;

/// Minimum time a process group gets to honour SIGTERM.
#[cfg(unix)]
const MIN_TERM_WAIT: Duration = Duration::from_secs(1);

/// Stop `child`, escalating until it is gone, and reap it.
///
/// `stdin` is the child's input pipe if the caller still holds it. Without
/// it the polite phase is skipped.
pub async fn shutdown_child(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    quit_command: Option<&str>,
    grace: Duration,
) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    let deadline = Instant::now() + grace;

    if let Some(mut stdin) = stdin {
        if let Some(command) = quit_command {
            let line = format!("{command}\n");
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!(error = %e, "Could not write quit command");
            }
            let _ = stdin.flush().await;
        }
        drop(stdin);

        if let Ok(result) = timeout(grace, child.wait()).await {
            return result;
        }
        debug!("Child ignored quit request, escalating");
    }

    force_stop(child, deadline).await
}

#[cfg(unix)]
async fn force_stop(child: &mut Child, deadline: Instant) -> io::Result<ExitStatus> {
    let Some(raw) = child.id() else {
        return child.wait().await;
    };
    let group = Pid::from_raw(i32::try_from(raw).map_err(io::Error::other)?);

    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return child.wait().await,
        Err(e) => warn!(pid = raw, error = %e, "SIGTERM to process group failed"),
    }

    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(MIN_TERM_WAIT);
    if let Ok(result) = timeout(wait, child.wait()).await {
        return result;
    }

    warn!(pid = raw, "Process group ignored SIGTERM, sending SIGKILL");
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid = raw, error = %e, "SIGKILL to process group failed, killing child only");
            child.start_kill()?;
        }
    }

    child.wait().await
}

#[cfg(not(unix))]
async fn force_stop(child: &mut Child, _deadline: Instant) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}
