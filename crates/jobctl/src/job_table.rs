//! Job table
//!
//! Owns the single foreground record and the bounded list of background
//! jobs. Pure bookkeeping: child status changes are observed by the
//! executors and fed in through [`JobTable::record_change`].

use std::collections::VecDeque;

use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::config::JobControlConfig;
use crate::types::{
    ChildStatus, JobEvent, JobEventKind, JobId, JobSummary, ProcessRecord, ProcessState,
};
use crate::{JobError, Result};

/// Foreground slot plus background jobs in arrival order.
#[derive(Debug)]
pub struct JobTable {
    foreground: Option<ProcessRecord>,
    background: Vec<ProcessRecord>,
    capacity: usize,
    next_job_id: u32,
    max_command_len: usize,
    pending: VecDeque<(Pid, ChildStatus)>,
    /// Jobs that stopped while the table was full. No id, no events; kept
    /// only so their members get reaped and terminated.
    orphans: Vec<ProcessRecord>,
}

impl JobTable {
    pub fn new(capacity: usize, max_command_len: usize) -> Self {
        Self {
            foreground: None,
            background: Vec::with_capacity(capacity.min(16)),
            capacity,
            next_job_id: 1,
            max_command_len,
            pending: VecDeque::new(),
            orphans: Vec::new(),
        }
    }

    pub fn from_config(config: &JobControlConfig) -> Self {
        Self::new(config.max_background_jobs, config.max_command_len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ------------------------------------------------------------------------
    // Foreground slot
    // ------------------------------------------------------------------------

    /// Register the foreground job.
    ///
    /// A running foreground job must be cleared (or moved to the background)
    /// first; a stopped leftover is simply replaced.
    pub fn set_foreground(&mut self, pid: Pid, pgid: Pid, command: &str) -> Result<()> {
        if let Some(current) = &self.foreground {
            if current.state == ProcessState::Running {
                return Err(JobError::already_occupied(format!(
                    "pid {} ({}) is still in the foreground",
                    current.pid, current.command
                )));
            }
        }
        debug!(pid = %pid, pgid = %pgid, command = %command, "jobs.set_foreground");
        self.foreground = Some(ProcessRecord::new(pid, pgid, command, self.max_command_len));
        Ok(())
    }

    /// Replace the member list of the foreground job (pipelines, or members
    /// already reaped by the wait loop). No-op without a foreground job.
    pub fn set_foreground_members(&mut self, members: Vec<Pid>) {
        if let Some(fg) = self.foreground.as_mut() {
            fg.members = members;
        }
    }

    pub fn clear_foreground(&mut self) -> Option<ProcessRecord> {
        self.foreground.take()
    }

    pub fn get_foreground(&self) -> Option<&ProcessRecord> {
        self.foreground.as_ref()
    }

    /// Park the foreground job as a stopped background job.
    ///
    /// On `TableFull` the foreground slot is still released and no job id is
    /// consumed. The record moves to the orphan list instead.
    pub fn move_foreground_to_background(&mut self) -> Result<JobId> {
        let mut record = self
            .foreground
            .take()
            .ok_or_else(|| JobError::no_foreground_job("nothing to move to the background"))?;

        if self.background.len() >= self.capacity {
            warn!(pid = %record.pid, command = %record.command, capacity = self.capacity,
                "jobs.move_to_background: table full, job left untracked");
            self.orphans.push(record);
            return Err(JobError::table_full(format!(
                "maximum of {} background jobs reached",
                self.capacity
            )));
        }

        let job_id = JobId::new(self.next_job_id);
        self.next_job_id += 1;
        record.job_id = Some(job_id);
        record.state = ProcessState::Stopped;
        debug!(job_id = %job_id, pid = %record.pid, "jobs.move_to_background");
        self.background.push(record);
        Ok(job_id)
    }

    /// Take a background job back into the foreground slot (`fg`).
    ///
    /// The record gives up its job id; it gets a fresh one if it stops again.
    pub fn move_background_to_foreground(&mut self, job_id: JobId) -> Result<&ProcessRecord> {
        if let Some(current) = &self.foreground {
            if current.state == ProcessState::Running {
                return Err(JobError::already_occupied(format!(
                    "pid {} is still in the foreground",
                    current.pid
                )));
            }
        }
        let index = self
            .background
            .iter()
            .position(|r| r.job_id == Some(job_id))
            .ok_or_else(|| JobError::job_not_found(format!("%{}", job_id)))?;

        let mut record = self.background.remove(index);
        record.job_id = None;
        record.state = ProcessState::Running;
        debug!(job_id = %job_id, pid = %record.pid, "jobs.move_to_foreground");
        Ok(self.foreground.insert(record))
    }

    // ------------------------------------------------------------------------
    // Background collection
    // ------------------------------------------------------------------------

    /// Background job whose leader or any live member is `pid`.
    pub fn find_by_pid(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.background
            .iter()
            .find(|r| r.pid == pid || r.is_member(pid))
    }

    pub fn find_by_job_id(&self, job_id: JobId) -> Option<&ProcessRecord> {
        self.background.iter().find(|r| r.job_id == Some(job_id))
    }

    /// Returns false if no background job contains `pid`.
    pub fn update_state(&mut self, pid: Pid, state: ProcessState) -> bool {
        match self.position_of(pid) {
            Some(index) => {
                self.background[index].state = state;
                true
            }
            None => false,
        }
    }

    /// Remove the job containing `pid`, keeping the order of the rest.
    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRecord> {
        self.position_of(pid).map(|index| self.background.remove(index))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.background.iter()
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.background
            .iter()
            .filter_map(|r| {
                r.job_id.map(|job_id| JobSummary {
                    job_id,
                    command: r.command.clone(),
                    state: r.state,
                })
            })
            .collect()
    }

    /// Every unreaped pid of every background job.
    pub fn tracked_pids(&self) -> Vec<Pid> {
        self.background
            .iter()
            .flat_map(|r| r.members.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.background.len()
    }

    pub fn is_empty(&self) -> bool {
        self.background.is_empty()
    }

    /// Remove and return all background jobs (shutdown).
    pub fn drain_background(&mut self) -> Vec<ProcessRecord> {
        std::mem::take(&mut self.background)
    }

    /// Unreaped members of untracked jobs.
    pub fn orphaned_pids(&self) -> Vec<Pid> {
        self.orphans
            .iter()
            .flat_map(|r| r.members.iter().copied())
            .collect()
    }

    /// Drop a reaped orphan member; the record goes with its last member.
    pub fn forget_orphan(&mut self, pid: Pid) {
        for record in &mut self.orphans {
            record.members.retain(|&m| m != pid);
        }
        self.orphans.retain(|r| !r.members.is_empty());
    }

    /// Remove and return all untracked jobs (shutdown).
    pub fn drain_orphans(&mut self) -> Vec<ProcessRecord> {
        std::mem::take(&mut self.orphans)
    }

    fn position_of(&self, pid: Pid) -> Option<usize> {
        self.background
            .iter()
            .position(|r| r.pid == pid || r.is_member(pid))
    }

    // ------------------------------------------------------------------------
    // State changes
    // ------------------------------------------------------------------------

    /// Queue a status observed by `waitpid` for the next `reap_changes`.
    pub fn record_change(&mut self, pid: Pid, status: ChildStatus) {
        self.pending.push_back((pid, status));
    }

    /// Apply queued changes, emitting exactly one event per job transition.
    ///
    /// A job exits only when its last member is reaped; the last member's
    /// status decides between `Exited` and `Terminated`.
    pub fn reap_changes<F>(&mut self, mut notify: F)
    where
        F: FnMut(JobEvent),
    {
        while let Some((pid, status)) = self.pending.pop_front() {
            let Some(index) = self.position_of(pid) else {
                trace!(pid = %pid, ?status, "jobs.reap: untracked pid");
                continue;
            };
            let record = &mut self.background[index];
            let Some(job_id) = record.job_id else {
                continue;
            };

            let kind = match status {
                ChildStatus::Exited(_) | ChildStatus::Signaled(_) => {
                    record.members.retain(|&m| m != pid);
                    if !record.members.is_empty() {
                        continue;
                    }
                    record.state = ProcessState::Done;
                    match status {
                        ChildStatus::Signaled(sig) => JobEventKind::Terminated(sig),
                        ChildStatus::Exited(code) => JobEventKind::Exited(code),
                        _ => unreachable!(),
                    }
                }
                ChildStatus::Stopped(_) => {
                    if record.state == ProcessState::Stopped {
                        continue;
                    }
                    record.state = ProcessState::Stopped;
                    JobEventKind::Stopped
                }
                ChildStatus::Continued => {
                    if record.state != ProcessState::Stopped {
                        continue;
                    }
                    record.state = ProcessState::Running;
                    JobEventKind::Resumed
                }
            };

            let event = JobEvent {
                job_id,
                pid: record.pid,
                command: record.command.clone(),
                kind,
            };
            if record.state == ProcessState::Done {
                self.background.remove(index);
            }
            debug!(job_id = %event.job_id, kind = ?event.kind, "jobs.reap");
            notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    fn stop_foreground(table: &mut JobTable, n: i32, command: &str) -> JobId {
        table.set_foreground(pid(n), pid(n), command).unwrap();
        table.move_foreground_to_background().unwrap()
    }

    fn collect(table: &mut JobTable) -> Vec<JobEvent> {
        let mut events = Vec::new();
        table.reap_changes(|e| events.push(e));
        events
    }

    #[test]
    fn test_foreground_slot_lifecycle() {
        let mut table = JobTable::new(4, 511);
        assert!(table.get_foreground().is_none());

        table.set_foreground(pid(10), pid(10), "sleep 5").unwrap();
        let fg = table.get_foreground().unwrap();
        assert_eq!(fg.pid, pid(10));
        assert_eq!(fg.job_id, None);

        let err = table.set_foreground(pid(11), pid(11), "ls").unwrap_err();
        assert!(matches!(err, JobError::AlreadyOccupied { .. }));

        assert!(table.clear_foreground().is_some());
        assert!(table.clear_foreground().is_none());
        table.set_foreground(pid(11), pid(11), "ls").unwrap();
    }

    #[test]
    fn test_move_without_foreground() {
        let mut table = JobTable::new(4, 511);
        let err = table.move_foreground_to_background().unwrap_err();
        assert!(matches!(err, JobError::NoForegroundJob { .. }));
    }

    #[test]
    fn test_job_ids_monotonic_across_removals() {
        let mut table = JobTable::new(4, 511);
        assert_eq!(stop_foreground(&mut table, 1, "a").get(), 1);
        assert_eq!(stop_foreground(&mut table, 2, "b").get(), 2);

        table.remove(pid(1));
        table.remove(pid(2));
        assert!(table.is_empty());

        assert_eq!(stop_foreground(&mut table, 3, "c").get(), 3);
        assert!(table.get_foreground().is_none());
        assert_eq!(table.find_by_pid(pid(3)).unwrap().state, ProcessState::Stopped);
    }

    #[test]
    fn test_table_full_releases_foreground() {
        let mut table = JobTable::new(1, 511);
        stop_foreground(&mut table, 1, "a");

        table.set_foreground(pid(2), pid(2), "b").unwrap();
        let err = table.move_foreground_to_background().unwrap_err();
        assert!(matches!(err, JobError::TableFull { .. }));
        assert!(table.get_foreground().is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.tracked_pids(), vec![pid(1)]);
        assert_eq!(table.orphaned_pids(), vec![pid(2)]);

        // Orphans never produce events.
        table.record_change(pid(2), ChildStatus::Exited(0));
        assert!(collect(&mut table).is_empty());
        table.forget_orphan(pid(2));
        assert!(table.orphaned_pids().is_empty());

        // The failed move consumed no id.
        table.remove(pid(1));
        assert_eq!(stop_foreground(&mut table, 3, "c").get(), 2);
    }

    #[test]
    fn test_orphaned_pipeline_drops_after_last_member() {
        let mut table = JobTable::new(0, 511);
        table.set_foreground(pid(50), pid(50), "yes | head").unwrap();
        table.set_foreground_members(vec![pid(50), pid(51)]);
        assert!(table.move_foreground_to_background().is_err());

        table.forget_orphan(pid(50));
        assert_eq!(table.orphaned_pids(), vec![pid(51)]);

        let drained = table.drain_orphans();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pgid, pid(50));
        assert!(table.orphaned_pids().is_empty());
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut table = JobTable::new(8, 511);
        for n in 1..=4 {
            stop_foreground(&mut table, n, &format!("job{}", n));
        }
        table.remove(pid(2));
        let commands: Vec<_> = table.jobs().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["job1", "job3", "job4"]);
        assert!(table.remove(pid(99)).is_none());
    }

    #[test]
    fn test_update_state() {
        let mut table = JobTable::new(4, 511);
        stop_foreground(&mut table, 5, "vim");
        assert!(table.update_state(pid(5), ProcessState::Running));
        assert_eq!(table.find_by_pid(pid(5)).unwrap().state, ProcessState::Running);
        assert!(!table.update_state(pid(6), ProcessState::Running));
    }

    #[test]
    fn test_reap_exit_removes_job() {
        let mut table = JobTable::new(4, 511);
        let id = stop_foreground(&mut table, 7, "sleep 1");
        table.record_change(pid(7), ChildStatus::Exited(0));

        let events = collect(&mut table);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, id);
        assert_eq!(events[0].kind, JobEventKind::Exited(0));
        assert!(table.is_empty());

        // Nothing left to report.
        assert!(collect(&mut table).is_empty());
    }

    #[test]
    fn test_reap_stop_resume_transitions() {
        let mut table = JobTable::new(4, 511);
        stop_foreground(&mut table, 8, "top");

        table.record_change(pid(8), ChildStatus::Continued);
        table.record_change(pid(8), ChildStatus::Continued);
        table.record_change(pid(8), ChildStatus::Stopped(Signal::SIGTSTP));
        table.record_change(pid(8), ChildStatus::Signaled(Signal::SIGKILL));

        let kinds: Vec<_> = collect(&mut table).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Resumed,
                JobEventKind::Stopped,
                JobEventKind::Terminated(Signal::SIGKILL),
            ]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_pipeline_exits_after_last_member() {
        let mut table = JobTable::new(4, 511);
        table.set_foreground(pid(20), pid(20), "cat | sort").unwrap();
        table.set_foreground_members(vec![pid(20), pid(21)]);
        table.move_foreground_to_background().unwrap();

        table.record_change(pid(20), ChildStatus::Exited(0));
        assert!(collect(&mut table).is_empty());
        assert_eq!(table.tracked_pids(), vec![pid(21)]);

        table.record_change(pid(21), ChildStatus::Exited(1));
        let events = collect(&mut table);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, JobEventKind::Exited(1));
        assert_eq!(events[0].pid, pid(20));
    }

    #[test]
    fn test_move_background_to_foreground() {
        let mut table = JobTable::new(4, 511);
        let id = stop_foreground(&mut table, 30, "less");

        let fg = table.move_background_to_foreground(id).unwrap();
        assert_eq!(fg.pid, pid(30));
        assert_eq!(fg.job_id, None);
        assert_eq!(fg.state, ProcessState::Running);
        assert!(table.is_empty());

        let err = table.move_background_to_foreground(JobId::new(9)).unwrap_err();
        assert!(matches!(err, JobError::AlreadyOccupied { .. }));

        // Stopping again hands out a fresh id.
        assert_eq!(table.move_foreground_to_background().unwrap().get(), 2);
    }

    #[test]
    fn test_summaries_and_command_bound() {
        let mut table = JobTable::new(4, 8);
        stop_foreground(&mut table, 40, "a-very-long-command");
        let rows = table.summaries();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command, "a-very-l");
        assert_eq!(rows[0].state, ProcessState::Stopped);
    }
}
