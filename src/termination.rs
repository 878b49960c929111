/// Bounded, idempotent termination of a supervised process group.
///
/// SIGTERM to the whole group, a short grace period, then SIGKILL to the
/// whole group and a bounded wait for it to empty. If group signaling fails
/// outright, the launched child is signaled directly instead. A group that
/// is already empty is a success, so calling this twice is harmless.
use crate::config::TerminationConfig;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(25);

/// How the process group ended up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Nothing was running; no signal was needed.
    AlreadyGone,
    /// The group exited within the grace period after SIGTERM.
    Graceful,
    /// The group needed SIGKILL.
    Killed,
    /// Group signaling failed; the launched child was killed directly.
    HandleOnly,
}

/// Errors from terminating a process group.
#[derive(Debug)]
pub enum TerminationError {
    /// Members of the group were still alive after every escalation step.
    Survived { pgid: i32 },
}

impl std::fmt::Display for TerminationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationError::Survived { pgid } => {
                write!(f, "process group {pgid} still alive after SIGKILL")
            }
        }
    }
}

impl std::error::Error for TerminationError {}

pub struct Enforcer {
    grace_period: Duration,
    kill_wait: Duration,
    handle_kill_wait: Duration,
}

impl Enforcer {
    pub fn new(config: &TerminationConfig) -> Self {
        Self {
            grace_period: Duration::from_millis(config.grace_period_ms),
            kill_wait: Duration::from_millis(config.kill_wait_ms),
            handle_kill_wait: Duration::from_millis(config.handle_kill_wait_ms),
        }
    }

    /// Terminate every process in group `pgid`.
    ///
    /// `handle` is the originally launched child (the group leader). It is
    /// reaped while waiting so a zombie leader does not keep the group
    /// looking alive, and it is the fallback target if group signals fail.
    pub async fn terminate(
        &self,
        pgid: i32,
        mut handle: Option<&mut Child>,
    ) -> Result<TerminationOutcome, TerminationError> {
        if !group_alive(pgid, &mut handle) {
            tracing::debug!(pgid, "process group already empty");
            return Ok(TerminationOutcome::AlreadyGone);
        }

        tracing::info!(pgid, "sending SIGTERM to process group");
        match signal_group(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(TerminationOutcome::AlreadyGone),
            Err(e) => tracing::warn!(pgid, error = %e, "SIGTERM to process group failed"),
        }

        if self.wait_empty(pgid, &mut handle, self.grace_period).await {
            tracing::info!(pgid, "process group exited after SIGTERM");
            return Ok(TerminationOutcome::Graceful);
        }

        tracing::warn!(pgid, "process group survived SIGTERM, sending SIGKILL");
        match signal_group(pgid, Signal::SIGKILL) {
            Ok(()) => {
                if self.wait_empty(pgid, &mut handle, self.kill_wait).await {
                    return Ok(TerminationOutcome::Killed);
                }
                tracing::warn!(pgid, "process group still alive after SIGKILL");
            }
            Err(Errno::ESRCH) => return Ok(TerminationOutcome::Graceful),
            Err(e) => tracing::warn!(pgid, error = %e, "SIGKILL to process group failed"),
        }

        self.kill_handle(pgid, handle).await
    }

    /// Last resort: signal the launched child on its own.
    async fn kill_handle(
        &self,
        pgid: i32,
        handle: Option<&mut Child>,
    ) -> Result<TerminationOutcome, TerminationError> {
        let Some(child) = handle else {
            return Err(TerminationError::Survived { pgid });
        };

        if let Some(pid) = child.id() {
            tracing::warn!(pid, "falling back to signaling the launched process directly");
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if wait_child(child, self.handle_kill_wait).await {
                return Ok(TerminationOutcome::HandleOnly);
            }
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid, error = %e, "failed to kill launched process");
            }
            if !wait_child(child, self.handle_kill_wait).await {
                return Err(TerminationError::Survived { pgid });
            }
        }

        let mut handle = Some(child);
        if group_alive(pgid, &mut handle) {
            tracing::warn!(pgid, "launched process reaped but group members remain");
            return Err(TerminationError::Survived { pgid });
        }
        Ok(TerminationOutcome::HandleOnly)
    }

    async fn wait_empty(
        &self,
        pgid: i32,
        handle: &mut Option<&mut Child>,
        limit: Duration,
    ) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !group_alive(pgid, handle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

fn signal_group(pgid: i32, sig: Signal) -> Result<(), Errno> {
    signal::killpg(Pid::from_raw(pgid), sig)
}

/// Whether any non-zombie member of group `pgid` remains.
fn group_alive(pgid: i32, handle: &mut Option<&mut Child>) -> bool {
    if let Some(child) = handle.as_deref_mut() {
        // Reap the leader if it has exited.
        let _ = child.try_wait();
    }
    match live_members(pgid) {
        Some(n) => n > 0,
        None => !matches!(signal::killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH)),
    }
}

/// Count group members that are not zombies. `None` if `/proc` is unusable.
#[cfg(target_os = "linux")]
fn live_members(pgid: i32) -> Option<usize> {
    let all = procfs::process::all_processes().ok()?;
    let count = all
        .flatten()
        .filter_map(|p| p.stat().ok())
        .filter(|stat| stat.pgrp == pgid && !matches!(stat.state, 'Z' | 'X' | 'x'))
        .count();
    Some(count)
}

#[cfg(not(target_os = "linux"))]
fn live_members(_pgid: i32) -> Option<usize> {
    None
}

async fn wait_child(child: &mut Child, limit: Duration) -> bool {
    matches!(tokio::time::timeout(limit, child.wait()).await, Ok(Ok(_)))
}
