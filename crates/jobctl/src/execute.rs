//! Single-command and pipeline executors
//!
//! Both share one spawning path: a pipeline of one whose stderr also goes to
//! the capture pipe is a single command. Every stage joins the process group
//! of the first-spawned stage; the parent closes each pipe end it no longer
//! needs right after the fork that consumed it, so EOF propagates as soon as
//! the last writer exits.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::capture::{cloexec_pipe, CaptureBuffer, CapturePipe, CapturedOutput, Completion};
use crate::child::{spawn, PreparedCommand, StageFds};
use crate::command::{pipeline_text, CommandSpec};
use crate::config::JobControlConfig;
use crate::job_table::JobTable;
use crate::terminal::Coordinator;
use crate::wait::{signal_group, wait_for_job, EventHook, ForegroundSignals};
use crate::{JobError, Result};

// ============================================================================
// Stage wiring
// ============================================================================

/// Where a stage reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    /// The shell's own stdin.
    Inherit,
    /// Read end of inter-stage pipe `n`.
    Pipe(usize),
}

/// Where a stage writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutput {
    /// Write end of inter-stage pipe `n`.
    Pipe(usize),
    /// The capture pipe.
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    pub stdin: StageInput,
    pub stdout: StageOutput,
}

/// Wiring for an `n`-stage pipeline: pipe `i` connects stage `i` to stage
/// `i + 1`, and only the last stage writes to the capture pipe.
pub fn plan_stages(n: usize) -> Vec<StagePlan> {
    (0..n)
        .map(|i| StagePlan {
            stdin: if i == 0 {
                StageInput::Inherit
            } else {
                StageInput::Pipe(i - 1)
            },
            stdout: if i + 1 == n {
                StageOutput::Capture
            } else {
                StageOutput::Pipe(i)
            },
        })
        .collect()
}

/// Number of inter-stage pipes a plan needs.
pub fn pipe_count(plan: &[StagePlan]) -> usize {
    plan.iter()
        .filter(|s| matches!(s.stdout, StageOutput::Pipe(_)))
        .count()
}

// ============================================================================
// Execution
// ============================================================================

/// Output of a foreground run plus the capture pipe of a job that stopped
/// and was parked in the background table.
#[derive(Debug)]
pub(crate) struct Execution {
    pub output: CapturedOutput,
    pub parked: Option<CapturePipe>,
}

/// Everything an executor borrows from the facade.
pub(crate) struct ExecContext<'a, 't> {
    pub table: &'a mut JobTable,
    pub coordinator: Coordinator<'t>,
    pub config: &'a JobControlConfig,
    pub signals: &'a ForegroundSignals,
}

/// Run one command with stdout and stderr captured.
pub(crate) fn execute_command(
    ctx: ExecContext<'_, '_>,
    command: &CommandSpec,
    hook: Option<&mut dyn EventHook>,
) -> Result<Execution> {
    let text = command.display_text();
    launch(ctx, std::slice::from_ref(command), &text, true, hook)
}

/// Run a pipeline; only the last stage's stdout is captured.
pub(crate) fn execute_pipeline(
    ctx: ExecContext<'_, '_>,
    stages: &[CommandSpec],
    hook: Option<&mut dyn EventHook>,
) -> Result<Execution> {
    if stages.is_empty() {
        return Err(JobError::invalid_command("empty pipeline"));
    }
    let text = pipeline_text(stages);
    launch(ctx, stages, &text, false, hook)
}

fn launch(
    ctx: ExecContext<'_, '_>,
    stages: &[CommandSpec],
    text: &str,
    capture_stderr: bool,
    hook: Option<&mut dyn EventHook>,
) -> Result<Execution> {
    let prepared = stages
        .iter()
        .map(PreparedCommand::new)
        .collect::<Result<Vec<_>>>()?;

    let (capture_read, capture_write) = cloexec_pipe()
        .map_err(|e| JobError::spawn_failed(format!("capture pipe: {}", e)))?;
    let pipe = CapturePipe::new(capture_read, ctx.config.read_chunk)?;

    let plan = plan_stages(prepared.len());
    let pids = spawn_stages(&prepared, &plan, capture_write, capture_stderr)?;
    let leader = pids[0];

    if let Err(e) = ctx.table.set_foreground(leader, leader, text) {
        abort_spawned(leader, &pids);
        return Err(e);
    }
    ctx.table.set_foreground_members(pids);

    run_foreground(ctx, pipe, false, hook)
}

/// Fork every stage. On failure the stages already running are killed and
/// reaped so nothing is left behind.
fn spawn_stages(
    prepared: &[PreparedCommand],
    plan: &[StagePlan],
    capture_write: OwnedFd,
    capture_stderr: bool,
) -> Result<Vec<Pid>> {
    let mut links: Vec<(Option<OwnedFd>, Option<OwnedFd>)> = Vec::with_capacity(pipe_count(plan));
    for _ in 0..pipe_count(plan) {
        let (read, write) = cloexec_pipe()
            .map_err(|e| JobError::spawn_failed(format!("stage pipe: {}", e)))?;
        links.push((Some(read), Some(write)));
    }

    let mut capture_write = Some(capture_write);
    let mut pids: Vec<Pid> = Vec::with_capacity(prepared.len());

    for (command, stage) in prepared.iter().zip(plan) {
        let stdin = match stage.stdin {
            StageInput::Inherit => None,
            StageInput::Pipe(n) => links[n].0.as_ref().map(|fd| fd.as_raw_fd()),
        };
        let stdout = match stage.stdout {
            StageOutput::Pipe(n) => links[n].1.as_ref().map(|fd| fd.as_raw_fd()),
            StageOutput::Capture => capture_write.as_ref().map(|fd| fd.as_raw_fd()),
        };
        let stderr = match stage.stdout {
            StageOutput::Capture if capture_stderr => stdout,
            _ => None,
        };

        let pgid = pids.first().copied();
        match spawn(command, pgid, StageFds { stdin, stdout, stderr }) {
            Ok(pid) => pids.push(pid),
            Err(e) => {
                if let Some(&leader) = pids.first() {
                    abort_spawned(leader, &pids);
                }
                return Err(e);
            }
        }

        // The child holds its own copies now.
        if let StageInput::Pipe(n) = stage.stdin {
            links[n].0.take();
        }
        match stage.stdout {
            StageOutput::Pipe(n) => {
                links[n].1.take();
            }
            StageOutput::Capture => {
                capture_write.take();
            }
        }
    }

    debug!(stages = pids.len(), leader = %pids[0], "execute.spawned");
    Ok(pids)
}

fn abort_spawned(pgid: Pid, pids: &[Pid]) {
    warn!(pgid = %pgid, count = pids.len(), "execute.abort: killing partial job");
    if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
        warn!(pgid = %pgid, error = %e, "execute.abort: kill failed");
    }
    for &pid in pids {
        let _ = waitpid(pid, None);
    }
}

/// Hand the terminal to the foreground job, run the wait loop and take the
/// terminal back. `resume` sends `SIGCONT` once the group owns the terminal.
pub(crate) fn run_foreground(
    ctx: ExecContext<'_, '_>,
    mut pipe: CapturePipe,
    resume: bool,
    hook: Option<&mut dyn EventHook>,
) -> Result<Execution> {
    let pgid = ctx
        .table
        .get_foreground()
        .map(|fg| fg.pgid)
        .ok_or_else(|| JobError::no_foreground_job("nothing to run"))?;

    let handed = match ctx.coordinator.give_terminal_to(pgid) {
        Ok(()) => true,
        Err(e) => {
            debug!(pgid = %pgid, error = %e, "execute: continuing without terminal");
            false
        }
    };

    if resume {
        if let Err(e) = signal_group(pgid, Signal::SIGCONT) {
            warn!(pgid = %pgid, error = %e, "execute: resume failed");
        }
    }

    let mut buffer = CaptureBuffer::new(ctx.config.output_capacity);
    ctx.signals.attach(pgid);
    let result = wait_for_job(ctx.table, ctx.config, &mut pipe, &mut buffer, hook);
    ctx.signals.detach();

    if handed {
        if let Err(e) = ctx.coordinator.take_terminal_back() {
            debug!(error = %e, "execute: terminal not reclaimed");
        }
    }

    let completion = result?;
    if buffer.is_truncated() {
        debug!(capacity = ctx.config.output_capacity, "execute: output truncated");
    }
    let parked = match completion {
        Completion::Stopped(_) => Some(pipe),
        _ => None,
    };
    Ok(Execution {
        output: CapturedOutput::new(buffer, completion),
        parked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_single_stage() {
        let plan = plan_stages(1);
        assert_eq!(
            plan,
            vec![StagePlan {
                stdin: StageInput::Inherit,
                stdout: StageOutput::Capture,
            }]
        );
        assert_eq!(pipe_count(&plan), 0);
    }

    #[test]
    fn test_plan_has_n_minus_one_pipes() {
        for n in 1..=6 {
            assert_eq!(pipe_count(&plan_stages(n)), n - 1);
        }
    }

    #[test]
    fn test_plan_three_stage_wiring() {
        let plan = plan_stages(3);
        assert_eq!(plan[0].stdin, StageInput::Inherit);
        assert_eq!(plan[0].stdout, StageOutput::Pipe(0));
        assert_eq!(plan[1].stdin, StageInput::Pipe(0));
        assert_eq!(plan[1].stdout, StageOutput::Pipe(1));
        assert_eq!(plan[2].stdin, StageInput::Pipe(1));
        assert_eq!(plan[2].stdout, StageOutput::Capture);

        let captured = plan
            .iter()
            .filter(|s| s.stdout == StageOutput::Capture)
            .count();
        assert_eq!(captured, 1);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let ownership = crate::terminal::TerminalOwnership::detached();
        let mut table = JobTable::new(4, 511);
        let config = JobControlConfig::default();
        let signals = ForegroundSignals::new();
        let ctx = ExecContext {
            table: &mut table,
            coordinator: Coordinator::new(&ownership),
            config: &config,
            signals: &signals,
        };
        let err = execute_pipeline(ctx, &[], None).unwrap_err();
        assert!(matches!(err, JobError::InvalidCommand { .. }));
        assert!(table.get_foreground().is_none());
    }
}
