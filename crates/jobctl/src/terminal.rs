//! Terminal and signal coordination
//!
//! [`TerminalOwnership`] is the shell's process-wide terminal state, captured
//! once and passed around by reference. [`Coordinator`] moves the terminal's
//! foreground group back and forth and sets up the signal posture of
//! freshly forked children.
//!
//! Every handoff failure is reported as the recoverable
//! `NoControllingTerminal`; callers keep running without terminal control.

use std::io::IsTerminal;
use std::os::fd::{AsFd, OwnedFd};

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{getpgrp, tcgetpgrp, tcsetpgrp, Pid};
use tracing::{debug, warn};

use crate::{JobError, Result};

/// Signals a job-control shell must not act on itself.
const SHELL_IGNORED_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

/// Dispositions reset to default in every child before exec.
const CHILD_DEFAULT_SIGNALS: [libc::c_int; 7] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGCHLD,
    libc::SIGPIPE,
];

/// The shell's own process group and its controlling terminal, if any.
#[derive(Debug)]
pub struct TerminalOwnership {
    shell_pgid: Pid,
    terminal: Option<OwnedFd>,
    saved_modes: Option<Termios>,
}

impl TerminalOwnership {
    /// Capture the terminal state at startup.
    ///
    /// Stdin is adopted as the controlling terminal only if it is a terminal
    /// whose foreground group is ours; a shell started in the background (or
    /// without a tty) runs detached. When a terminal is adopted the shell
    /// ignores the keyboard and background-I/O job-control signals.
    pub fn capture() -> Self {
        let shell_pgid = getpgrp();
        let stdin = std::io::stdin();

        if !stdin.is_terminal() {
            debug!(pgid = %shell_pgid, "terminal.capture: stdin is not a terminal");
            return Self::detached();
        }

        let terminal = match stdin.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                warn!(error = %e, "terminal.capture: cannot duplicate stdin");
                return Self::detached();
            }
        };

        match tcgetpgrp(&terminal) {
            Ok(fg) if fg == shell_pgid => {}
            Ok(fg) => {
                debug!(shell = %shell_pgid, foreground = %fg,
                    "terminal.capture: shell is not the foreground group");
                return Self::detached();
            }
            Err(e) => {
                debug!(error = %e, "terminal.capture: tcgetpgrp failed");
                return Self::detached();
            }
        }

        for sig in SHELL_IGNORED_SIGNALS {
            // SAFETY: SigIgn installs no handler code.
            if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
                warn!(signal = ?sig, error = %e, "terminal.capture: cannot ignore signal");
            }
        }

        let saved_modes = tcgetattr(&terminal).ok();
        debug!(pgid = %shell_pgid, "terminal.capture: controlling terminal adopted");
        Self {
            shell_pgid,
            terminal: Some(terminal),
            saved_modes,
        }
    }

    /// No terminal: embedded in a GUI, a test harness, or a pipe.
    pub fn detached() -> Self {
        Self {
            shell_pgid: getpgrp(),
            terminal: None,
            saved_modes: None,
        }
    }

    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

/// Hands the terminal to job process groups and takes it back.
#[derive(Debug, Clone, Copy)]
pub struct Coordinator<'t> {
    ownership: &'t TerminalOwnership,
}

impl<'t> Coordinator<'t> {
    pub fn new(ownership: &'t TerminalOwnership) -> Self {
        Self { ownership }
    }

    pub fn shell_pgid(&self) -> Pid {
        self.ownership.shell_pgid
    }

    /// True if a terminal is attached and our group is its foreground group.
    pub fn has_terminal_control(&self) -> bool {
        match &self.ownership.terminal {
            Some(tty) => tcgetpgrp(tty).map_or(false, |fg| fg == self.ownership.shell_pgid),
            None => false,
        }
    }

    /// Make `pgid` the terminal's foreground group.
    pub fn give_terminal_to(&self, pgid: Pid) -> Result<()> {
        let tty = self
            .ownership
            .terminal
            .as_ref()
            .ok_or_else(|| JobError::no_controlling_terminal("running detached"))?;

        if !self.has_terminal_control() {
            return Err(JobError::no_controlling_terminal(
                "shell is not the terminal's foreground group",
            ));
        }

        tcsetpgrp(tty, pgid).map_err(|e| {
            warn!(pgid = %pgid, error = %e, "terminal.give failed");
            JobError::no_controlling_terminal(format!("tcsetpgrp {}: {}", pgid, e.desc()))
        })?;
        debug!(pgid = %pgid, "terminal.give");
        Ok(())
    }

    /// Make the shell's group the foreground group again and restore the
    /// terminal modes saved at capture time.
    pub fn take_terminal_back(&self) -> Result<()> {
        let tty = self
            .ownership
            .terminal
            .as_ref()
            .ok_or_else(|| JobError::no_controlling_terminal("running detached"))?;

        tcsetpgrp(tty, self.ownership.shell_pgid).map_err(|e| {
            warn!(error = %e, "terminal.take_back failed");
            JobError::no_controlling_terminal(format!("tcsetpgrp: {}", e.desc()))
        })?;

        if let Some(modes) = &self.ownership.saved_modes {
            if let Err(e) = tcsetattr(tty, SetArg::TCSADRAIN, modes) {
                warn!(error = %e, "terminal.take_back: restoring modes failed");
            }
        }
        debug!(pgid = %self.ownership.shell_pgid, "terminal.take_back");
        Ok(())
    }

    /// Child-side setup between `fork` and `exec`.
    ///
    /// Restores default dispositions for the job-control signals, clears the
    /// inherited signal mask and joins process group `pgid` (0 makes the
    /// child its own group leader). Only async-signal-safe calls are made.
    pub fn prepare_child(pgid: libc::pid_t) {
        // SAFETY: signal, sigemptyset, sigprocmask and setpgid are all
        // async-signal-safe and operate on stack data only.
        unsafe {
            for sig in CHILD_DEFAULT_SIGNALS {
                libc::signal(sig, libc::SIG_DFL);
            }
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            libc::setpgid(0, pgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_has_no_terminal() {
        let ownership = TerminalOwnership::detached();
        assert!(!ownership.has_terminal());
        assert_eq!(ownership.shell_pgid(), getpgrp());
    }

    #[test]
    fn test_detached_handoff_is_recoverable() {
        let ownership = TerminalOwnership::detached();
        let coordinator = Coordinator::new(&ownership);
        assert!(!coordinator.has_terminal_control());

        let err = coordinator.give_terminal_to(Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, JobError::NoControllingTerminal { .. }));
        assert!(err.is_recoverable());

        let err = coordinator.take_terminal_back().unwrap_err();
        assert!(err.is_recoverable());
    }
}
