//! Wait/drain loop
//!
//! Cooperative, single-threaded and non-blocking. Each iteration runs the
//! host's [`EventHook`], reads what the capture pipe has ready, polls every
//! live member of the foreground job with `WNOHANG | WUNTRACED`, and sleeps
//! for the poll interval. The only blocking read happens once every member
//! has exited.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::capture::{CaptureBuffer, CapturePipe, Completion, ReadOutcome};
use crate::config::JobControlConfig;
use crate::job_table::JobTable;
use crate::types::{ChildStatus, JobId};
use crate::{JobError, Result};

/// Chunks read per iteration before yielding back to the poll.
const READS_PER_ITERATION: usize = 16;

// ============================================================================
// Event hook
// ============================================================================

/// Read-only view of the running foreground job handed to the hook.
#[derive(Debug, Clone, Copy)]
pub struct ForegroundJob<'a> {
    pid: Pid,
    pgid: Pid,
    command: &'a str,
    members: &'a [Pid],
}

impl<'a> ForegroundJob<'a> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn command(&self) -> &'a str {
        self.command
    }

    /// Members not yet reaped, in stage order.
    pub fn members(&self) -> &'a [Pid] {
        self.members
    }

    /// Interrupt the whole group (Ctrl-C). The exit shows up on a later poll.
    pub fn send_interrupt(&self) -> Result<()> {
        signal_group(self.pgid, Signal::SIGINT)
    }

    /// Stop the whole group (Ctrl-Z). Repeating it before the loop notices
    /// the stop is harmless.
    pub fn send_stop(&self) -> Result<()> {
        signal_group(self.pgid, Signal::SIGTSTP)
    }
}

/// Host callback run on every wait-loop iteration.
///
/// Closures taking `&ForegroundJob<'_>` implement this directly; spell out
/// the parameter type so the closure is inferred as higher-ranked.
pub trait EventHook {
    /// Service pending host work. Must return promptly.
    fn process_events(&mut self, job: &ForegroundJob<'_>);

    /// The foreground job stopped. `job_id` is `None` if the background
    /// table was full and the job is no longer tracked.
    fn job_stopped(&mut self, _job_id: Option<JobId>, _command: &str) {}
}

impl<F> EventHook for F
where
    F: FnMut(&ForegroundJob<'_>),
{
    fn process_events(&mut self, job: &ForegroundJob<'_>) {
        self(job)
    }
}

// ============================================================================
// Foreground signals
// ============================================================================

/// Shared handle to whatever job currently runs in the foreground.
///
/// Cloneable and `Send`: a GUI thread or a signal-forwarding thread can hold
/// one and reach the job while `execute` is blocked in the wait loop.
#[derive(Debug, Clone, Default)]
pub struct ForegroundSignals {
    // Process group of the running foreground job, 0 when there is none.
    pgid: Arc<AtomicI32>,
}

impl ForegroundSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process group of the running foreground job, if any.
    pub fn current(&self) -> Option<Pid> {
        match self.pgid.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Interrupt the foreground job's group. No-op without one.
    pub fn send_interrupt(&self) -> Result<()> {
        self.signal(Signal::SIGINT)
    }

    /// Stop the foreground job's group. No-op without one; repeating it
    /// before the wait loop notices the stop is harmless.
    pub fn send_stop(&self) -> Result<()> {
        self.signal(Signal::SIGTSTP)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match self.current() {
            Some(pgid) => signal_group(pgid, signal),
            None => {
                trace!(signal = ?signal, "signals: no foreground job");
                Ok(())
            }
        }
    }

    pub(crate) fn attach(&self, pgid: Pid) {
        self.pgid.store(pgid.as_raw(), Ordering::SeqCst);
    }

    pub(crate) fn detach(&self) {
        self.pgid.store(0, Ordering::SeqCst);
    }
}

/// `killpg`, treating a vanished group as already handled.
pub(crate) fn signal_group(pgid: Pid, signal: Signal) -> Result<()> {
    match killpg(pgid, signal) {
        Ok(()) => {
            debug!(pgid = %pgid, signal = ?signal, "signal.group");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            trace!(pgid = %pgid, signal = ?signal, "signal.group: no such group");
            Ok(())
        }
        Err(e) => Err(JobError::signal(format!(
            "killpg {} {:?}: {}",
            pgid,
            signal,
            e.desc()
        ))),
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Run the loop for the job currently in the foreground slot.
///
/// On exit the foreground slot is cleared and trailing output drained. On
/// stop the job is moved to the background and the pipe is left as is. If
/// the background table is full the job is continued and left running,
/// untracked; its members are still reaped by later background polls.
///
/// The final drain blocks until every writer of the capture pipe is gone. A
/// descendant that outlives the job while holding its stdout (`sleep 60 &`
/// inside `sh -c`) keeps this call blocked, and the hook is not called
/// meanwhile.
pub(crate) fn wait_for_job(
    table: &mut JobTable,
    config: &JobControlConfig,
    pipe: &mut CapturePipe,
    buffer: &mut CaptureBuffer,
    mut hook: Option<&mut dyn EventHook>,
) -> Result<Completion> {
    let (pid, pgid, command, mut live) = match table.get_foreground() {
        Some(fg) => (fg.pid, fg.pgid, fg.command.clone(), fg.members.clone()),
        None => return Err(JobError::no_foreground_job("nothing to wait for")),
    };
    let last_stage = live.last().copied().unwrap_or(pid);
    let mut final_status: Option<ChildStatus> = None;
    let mut eof = false;

    debug!(pid = %pid, pgid = %pgid, members = live.len(), "wait.start");

    loop {
        if let Some(h) = hook.as_deref_mut() {
            let view = ForegroundJob {
                pid,
                pgid,
                command: &command,
                members: &live,
            };
            h.process_events(&view);
        }

        if !eof {
            eof = read_ready(pipe, buffer);
        }

        let mut stopped = false;
        live.retain(|&member| match poll_member(member) {
            Some(status) if status.is_finished() => {
                if member == last_stage || final_status.is_none() {
                    final_status = Some(status);
                }
                false
            }
            Some(ChildStatus::Stopped(_)) => {
                stopped = true;
                true
            }
            Some(_) => true,
            None => true,
        });

        if live.is_empty() {
            if !eof {
                if let Err(e) = pipe.drain_to_eof(buffer) {
                    warn!(pid = %pid, error = %e, "wait.drain failed");
                }
            }
            table.clear_foreground();
            let completion = match final_status {
                Some(ChildStatus::Signaled(sig)) => Completion::Signaled(sig),
                Some(ChildStatus::Exited(code)) => Completion::Exited(code),
                _ => Completion::Exited(0),
            };
            debug!(pid = %pid, ?completion, bytes = buffer.len(), "wait.done");
            return Ok(completion);
        }

        if stopped {
            table.set_foreground_members(live);
            let completion = match table.move_foreground_to_background() {
                Ok(job_id) => Completion::Stopped(job_id),
                Err(JobError::TableFull { .. }) => {
                    if let Err(e) = signal_group(pgid, Signal::SIGCONT) {
                        warn!(pgid = %pgid, error = %e, "wait: untracked job not continued");
                    }
                    Completion::StoppedUntracked
                }
                Err(e) => return Err(e),
            };
            if let Some(h) = hook.as_deref_mut() {
                h.job_stopped(completion_job_id(completion), &command);
            }
            debug!(pid = %pid, ?completion, "wait.stopped");
            return Ok(completion);
        }

        std::thread::sleep(config.poll_interval());
    }
}

fn completion_job_id(completion: Completion) -> Option<JobId> {
    match completion {
        Completion::Stopped(id) => Some(id),
        _ => None,
    }
}

/// Read a bounded burst. Returns true once the pipe reports EOF.
fn read_ready(pipe: &mut CapturePipe, buffer: &mut CaptureBuffer) -> bool {
    for _ in 0..READS_PER_ITERATION {
        match pipe.read_available(buffer) {
            Ok(ReadOutcome::Data(_)) => continue,
            Ok(ReadOutcome::WouldBlock) => return false,
            Ok(ReadOutcome::Eof) => return true,
            Err(e) => {
                warn!(error = %e, "wait.read failed, output abandoned");
                return true;
            }
        }
    }
    false
}

/// Non-blocking status check for one member. `ECHILD` means someone else
/// reaped it; it is reported as a clean exit.
fn poll_member(pid: Pid) -> Option<ChildStatus> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => ChildStatus::from_wait_status(status).map(|(_, s)| s),
        Err(Errno::EINTR) => None,
        Err(Errno::ECHILD) => {
            debug!(pid = %pid, "wait.poll: already reaped");
            Some(ChildStatus::Exited(0))
        }
        Err(e) => {
            warn!(pid = %pid, error = %e, "wait.poll failed, member dropped");
            Some(ChildStatus::Exited(0))
        }
    }
}
