//! JobControl facade
//!
//! The one object an embedding shell or GUI holds: configuration, terminal
//! ownership, the job table and the capture pipes of stopped jobs.
//!
//! `execute` borrows the facade mutably until the job finishes or stops.
//! To interrupt or stop it meanwhile, take a [`ForegroundSignals`] handle
//! from [`JobControl::foreground_signals`] beforehand and use it from the
//! hook or from another thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::capture::{cloexec_pipe, CapturePipe, CapturedOutput};
use crate::command::CommandSpec;
use crate::config::JobControlConfig;
use crate::execute::{self, ExecContext, Execution};
use crate::job_table::JobTable;
use crate::terminal::{Coordinator, TerminalOwnership};
use crate::types::{ChildStatus, JobEvent, JobEventKind, JobId, JobSummary, ProcessRecord};
use crate::wait::{signal_group, EventHook, ForegroundSignals};
use crate::{JobError, Result};

/// Time background jobs get to exit after `SIGTERM` before `SIGKILL`.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct JobControl {
    config: JobControlConfig,
    terminal: TerminalOwnership,
    table: JobTable,
    /// Capture pipes of stopped jobs, reused by `continue_in_foreground`.
    parked: HashMap<JobId, CapturePipe>,
    signals: ForegroundSignals,
}

impl JobControl {
    pub fn new(config: JobControlConfig, terminal: TerminalOwnership) -> Result<Self> {
        config.validate()?;
        debug!(
            capacity = config.max_background_jobs,
            terminal = terminal.has_terminal(),
            "job_control.new"
        );
        Ok(Self {
            table: JobTable::from_config(&config),
            config,
            terminal,
            parked: HashMap::new(),
            signals: ForegroundSignals::new(),
        })
    }

    /// Default configuration, no terminal.
    pub fn detached() -> Self {
        let config = JobControlConfig::default();
        Self {
            table: JobTable::from_config(&config),
            config,
            terminal: TerminalOwnership::detached(),
            parked: HashMap::new(),
            signals: ForegroundSignals::new(),
        }
    }

    pub fn config(&self) -> &JobControlConfig {
        &self.config
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    pub fn terminal(&self) -> &TerminalOwnership {
        &self.terminal
    }

    /// Handle that reaches the foreground job while `execute` runs.
    pub fn foreground_signals(&self) -> ForegroundSignals {
        self.signals.clone()
    }

    fn context(&mut self) -> ExecContext<'_, '_> {
        ExecContext {
            table: &mut self.table,
            coordinator: Coordinator::new(&self.terminal),
            config: &self.config,
            signals: &self.signals,
        }
    }

    fn finish(&mut self, execution: Execution) -> CapturedOutput {
        if let (Some(job_id), Some(pipe)) = (execution.output.stopped_job(), execution.parked) {
            self.parked.insert(job_id, pipe);
        }
        execution.output
    }

    // ========================================================================
    // Foreground execution
    // ========================================================================

    /// Run a single command in the foreground, capturing stdout and stderr.
    ///
    /// Only spawn-time problems are errors; a crash or signal death of the
    /// child is reported through [`CapturedOutput::completion`].
    pub fn execute(
        &mut self,
        command: &CommandSpec,
        hook: Option<&mut dyn EventHook>,
    ) -> Result<CapturedOutput> {
        let execution = execute::execute_command(self.context(), command, hook)?;
        Ok(self.finish(execution))
    }

    /// Run a pipeline in one process group, capturing the last stage's stdout.
    pub fn execute_pipeline(
        &mut self,
        stages: &[CommandSpec],
        hook: Option<&mut dyn EventHook>,
    ) -> Result<CapturedOutput> {
        let execution = execute::execute_pipeline(self.context(), stages, hook)?;
        Ok(self.finish(execution))
    }

    /// Interrupt the foreground job's group. No-op without one.
    pub fn send_interrupt(&self) -> Result<()> {
        self.signals.send_interrupt()
    }

    /// Stop the foreground job's group. No-op without one.
    pub fn send_stop(&self) -> Result<()> {
        self.signals.send_stop()
    }

    // ========================================================================
    // Background jobs
    // ========================================================================

    /// Poll every tracked background pid and deliver one event per job
    /// transition. Finished jobs are gone from `list_jobs` afterwards.
    pub fn poll_background_jobs<F>(&mut self, mut notify: F)
    where
        F: FnMut(JobEvent),
    {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        for pid in self.table.tracked_pids() {
            match waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some((pid, change)) = ChildStatus::from_wait_status(status) {
                        self.table.record_change(pid, change);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    // Reaped behind our back; drop it so the job can finish.
                    debug!(pid = %pid, error = %e, "job_control.poll: member gone");
                    self.table.record_change(pid, ChildStatus::Exited(0));
                }
            }
        }

        self.reap_orphans();

        let parked = &mut self.parked;
        self.table.reap_changes(|event| {
            if matches!(event.kind, JobEventKind::Exited(_) | JobEventKind::Terminated(_)) {
                parked.remove(&event.job_id);
            }
            notify(event);
        });
    }

    /// Reap members of jobs left untracked by a full table. No events.
    fn reap_orphans(&mut self) {
        for pid in self.table.orphaned_pids() {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    debug!(pid = %pid, "job_control.poll: untracked member reaped");
                    self.table.forget_orphan(pid);
                }
                _ => {}
            }
        }
    }

    /// Background jobs as (job id, command, state) rows, in arrival order.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.table.summaries()
    }

    /// Continue a stopped job in the background (`bg`). The state change is
    /// reported as `Resumed` by the next poll.
    pub fn resume_job(&mut self, job_id: JobId) -> Result<()> {
        let record = self
            .table
            .find_by_job_id(job_id)
            .ok_or_else(|| JobError::job_not_found(format!("%{}", job_id)))?;
        debug!(job_id = %job_id, pgid = %record.pgid, "job_control.resume");
        signal_group(record.pgid, Signal::SIGCONT)
    }

    /// Bring a background job to the foreground (`fg`): hand it the terminal,
    /// continue it and wait on it like a fresh execution.
    pub fn continue_in_foreground(
        &mut self,
        job_id: JobId,
        hook: Option<&mut dyn EventHook>,
    ) -> Result<CapturedOutput> {
        self.table.move_background_to_foreground(job_id)?;
        let pipe = match self.parked.remove(&job_id) {
            Some(pipe) => pipe,
            None => detached_pipe(self.config.read_chunk)?,
        };
        let execution = execute::run_foreground(self.context(), pipe, true, hook)?;
        Ok(self.finish(execution))
    }

    /// `SIGTERM` (plus `SIGCONT`, so stopped jobs see it) to every background
    /// group, then reap. Stragglers get `SIGKILL` after a grace period.
    pub fn terminate_all(&mut self) {
        let mut jobs = self.table.drain_background();
        jobs.extend(self.table.drain_orphans());
        self.parked.clear();
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "job_control.terminate_all");

        for job in &jobs {
            for signal in [Signal::SIGTERM, Signal::SIGCONT] {
                if let Err(e) = signal_group(job.pgid, signal) {
                    warn!(pgid = %job.pgid, error = %e, "job_control.terminate_all");
                }
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        let mut remaining: Vec<Pid> = jobs.iter().flat_map(|j| j.members.clone()).collect();
        while !remaining.is_empty() && Instant::now() < deadline {
            remaining.retain(|&pid| {
                matches!(
                    waitpid(pid, Some(WaitPidFlag::WNOHANG)),
                    Ok(WaitStatus::StillAlive) | Err(Errno::EINTR)
                )
            });
            std::thread::sleep(self.config.poll_interval());
        }

        if !remaining.is_empty() {
            kill_stragglers(&jobs, &remaining);
        }
    }
}

impl Drop for JobControl {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

fn kill_stragglers(jobs: &[ProcessRecord], remaining: &[Pid]) {
    for job in jobs.iter().filter(|j| j.members.iter().any(|m| remaining.contains(m))) {
        warn!(pgid = %job.pgid, command = %job.command, "job_control.terminate_all: killing");
        let _ = signal_group(job.pgid, Signal::SIGKILL);
    }
    for &pid in remaining {
        let _ = waitpid(pid, None);
    }
}

/// A capture pipe with no writer, for jobs whose own pipe is gone.
fn detached_pipe(chunk: usize) -> Result<CapturePipe> {
    let (read, _write) = cloexec_pipe()?;
    CapturePipe::new(read, chunk)
}
