//! Job and process data model
//!
//! Plain data shared by the job table, the executors and the facade.

use std::fmt;
use std::time::SystemTime;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Background job number. Assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

impl JobId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
    Done,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Running => "Running",
            ProcessState::Stopped => "Stopped",
            ProcessState::Done => "Done",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One launched command or pipeline.
///
/// `pid` is the first-spawned process (the group leader for pipelines) and
/// `members` holds every pid of the job that has not yet been reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub pgid: Pid,
    pub command: String,
    pub state: ProcessState,
    /// `None` while the record is the foreground job.
    pub job_id: Option<JobId>,
    pub started_at: SystemTime,
    pub members: Vec<Pid>,
}

impl ProcessRecord {
    pub fn new(pid: Pid, pgid: Pid, command: &str, max_command_len: usize) -> Self {
        Self {
            pid,
            pgid,
            command: truncate_command(command, max_command_len),
            state: ProcessState::Running,
            job_id: None,
            started_at: SystemTime::now(),
            members: vec![pid],
        }
    }

    pub fn is_member(&self, pid: Pid) -> bool {
        self.members.contains(&pid)
    }
}

/// Cut `command` to at most `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_command(command: &str, max: usize) -> String {
    if command.len() <= max {
        return command.to_string();
    }
    let mut end = max;
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    command[..end].to_string()
}

/// A state change observed for a single child by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(Signal),
    Stopped(Signal),
    Continued,
}

impl ChildStatus {
    /// Translate a `waitpid` result. `StillAlive` and ptrace events map to `None`.
    pub fn from_wait_status(status: WaitStatus) -> Option<(Pid, ChildStatus)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, ChildStatus::Exited(code))),
            WaitStatus::Signaled(pid, sig, _) => Some((pid, ChildStatus::Signaled(sig))),
            WaitStatus::Stopped(pid, sig) => Some((pid, ChildStatus::Stopped(sig))),
            WaitStatus::Continued(pid) => Some((pid, ChildStatus::Continued)),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ChildStatus::Exited(_) | ChildStatus::Signaled(_))
    }
}

/// What happened to a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Exited(i32),
    Terminated(Signal),
    Stopped,
    Resumed,
}

impl JobEventKind {
    fn label(self) -> &'static str {
        match self {
            JobEventKind::Exited(_) => "Done",
            JobEventKind::Terminated(_) => "Terminated",
            JobEventKind::Stopped => "Stopped",
            JobEventKind::Resumed => "Running",
        }
    }
}

/// Notification emitted once per background job transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub pid: Pid,
    pub command: String,
    pub kind: JobEventKind,
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]+ {:<24}{}", self.job_id, self.kind.label(), self.command)
    }
}

/// Row of `list_jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: JobId,
    pub command: String,
    pub state: ProcessState,
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]  {:<24}{}", self.job_id, self.state, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_command_ascii() {
        assert_eq!(truncate_command("sleep 10", 511), "sleep 10");
        assert_eq!(truncate_command("abcdef", 3), "abc");
    }

    #[test]
    fn test_truncate_command_utf8_boundary() {
        // 'é' is two bytes; cutting at 2 would split it.
        assert_eq!(truncate_command("aé", 2), "a");
    }

    #[test]
    fn test_new_record_defaults() {
        let pid = Pid::from_raw(42);
        let rec = ProcessRecord::new(pid, pid, "sleep 1", 511);
        assert_eq!(rec.state, ProcessState::Running);
        assert_eq!(rec.job_id, None);
        assert_eq!(rec.members, vec![pid]);
    }

    #[test]
    fn test_event_notification_format() {
        let event = JobEvent {
            job_id: JobId::new(3),
            pid: Pid::from_raw(10),
            command: "sleep 5".into(),
            kind: JobEventKind::Exited(0),
        };
        assert_eq!(event.to_string(), "[3]+ Done                    sleep 5");

        let event = JobEvent {
            kind: JobEventKind::Terminated(Signal::SIGTERM),
            ..event
        };
        assert_eq!(event.to_string(), "[3]+ Terminated              sleep 5");
    }

    #[test]
    fn test_child_status_from_wait_status() {
        let pid = Pid::from_raw(7);
        assert_eq!(
            ChildStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some((pid, ChildStatus::Exited(3)))
        );
        assert_eq!(
            ChildStatus::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGTSTP)),
            Some((pid, ChildStatus::Stopped(Signal::SIGTSTP)))
        );
        assert_eq!(ChildStatus::from_wait_status(WaitStatus::StillAlive), None);
        assert!(ChildStatus::Signaled(Signal::SIGKILL).is_finished());
        assert!(!ChildStatus::Continued.is_finished());
    }
}
