//! Forking and exec'ing a single job member
//!
//! Everything the child needs (C strings, argv pointer array, error
//! messages) is built in the parent before `fork`, so the child only makes
//! async-signal-safe libc calls between `fork` and `exec`. That keeps
//! spawning sound even when the host process is multi-threaded.

use std::ffi::{CString, NulError};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use tracing::{debug, trace};

use crate::command::{CommandSpec, RedirectDirection};
use crate::terminal::Coordinator;
use crate::{JobError, Result};

/// Exit status of a child whose `exec` failed.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Exit status of a child whose redirection target could not be opened.
pub const REDIRECT_FAILED_STATUS: i32 = 1;

const OUTPUT_MODE: libc::c_uint = 0o644;

struct PreparedRedirect {
    direction: RedirectDirection,
    path: CString,
    open_error: Vec<u8>,
}

/// A command ready to be exec'd from a forked child.
pub struct PreparedCommand {
    program: CString,
    // Owns the strings `argv_ptrs` points into.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    redirections: Vec<PreparedRedirect>,
    exec_error: Vec<u8>,
}

impl PreparedCommand {
    pub fn new(spec: &CommandSpec) -> Result<Self> {
        let program = spec
            .argv
            .first()
            .ok_or_else(|| JobError::invalid_command("empty argument list"))?;

        let argv = spec
            .argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<Vec<_>, NulError>>()
            .map_err(|e| JobError::invalid_command(e.to_string()))?;

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let redirections = spec
            .redirections
            .iter()
            .map(|r| {
                let path = CString::new(r.path.as_os_str().as_bytes())
                    .map_err(|e| JobError::invalid_command(e.to_string()))?;
                Ok(PreparedRedirect {
                    direction: r.direction,
                    path,
                    open_error: format!("jobctl: {}: cannot open\n", r.path.display()).into_bytes(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            program: argv[0].clone(),
            exec_error: format!("jobctl: {}: cannot execute\n", program).into_bytes(),
            _argv: argv,
            argv_ptrs,
            redirections,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }
}

/// Descriptors a stage's standard streams are wired to.
///
/// `None` keeps the stream inherited from the shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageFds {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
}

/// Fork one job member.
///
/// `pgid` is the group to join; `None` makes the child a new group leader.
/// The parent repeats the `setpgid` so the group exists by the time this
/// returns, whichever side runs first.
pub fn spawn(command: &PreparedCommand, pgid: Option<Pid>, fds: StageFds) -> Result<Pid> {
    // SAFETY: the child branch calls only async-signal-safe functions on data
    // prepared before the fork and never returns.
    let fork_result = unsafe { fork() }
        .map_err(|e| JobError::spawn_failed(format!("fork: {}", e.desc())))?;

    match fork_result {
        ForkResult::Child => {
            let target = pgid.map_or(0, Pid::as_raw);
            exec_child(command, target, fds)
        }
        ForkResult::Parent { child } => {
            let group = pgid.unwrap_or(child);
            match setpgid(child, group) {
                // EACCES: the child already exec'd; ESRCH: it already exited.
                Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
                Err(e) => trace!(pid = %child, error = %e, "spawn: parent setpgid"),
            }
            debug!(pid = %child, pgid = %group, program = ?command.program, "spawn");
            Ok(child)
        }
    }
}

fn exec_child(command: &PreparedCommand, pgid: libc::pid_t, fds: StageFds) -> ! {
    Coordinator::prepare_child(pgid);

    // SAFETY: fcntl, dup2, open, close, write, execvp and _exit are
    // async-signal-safe; all pointers come from CStrings owned by `command`.
    unsafe {
        // A source may sit on 0..=2 if the host closed its own streams; wiring
        // stdin first would then clobber it before stdout is set up.
        let stdin = fds.stdin.map(|fd| lift_fd(fd));
        let stdout = fds.stdout.map(|fd| lift_fd(fd));
        let stderr = fds.stderr.map(|fd| lift_fd(fd));

        if let Some(fd) = stdin {
            redirect_fd(fd, libc::STDIN_FILENO);
        }
        if let Some(fd) = stdout {
            redirect_fd(fd, libc::STDOUT_FILENO);
        }
        if let Some(fd) = stderr {
            redirect_fd(fd, libc::STDERR_FILENO);
        }

        for r in &command.redirections {
            let (fd, target) = match r.direction {
                RedirectDirection::Input => (
                    libc::open(r.path.as_ptr(), libc::O_RDONLY),
                    libc::STDIN_FILENO,
                ),
                RedirectDirection::Output => (
                    libc::open(
                        r.path.as_ptr(),
                        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                        OUTPUT_MODE,
                    ),
                    libc::STDOUT_FILENO,
                ),
            };
            if fd < 0 {
                write_stderr(&r.open_error);
                libc::_exit(REDIRECT_FAILED_STATUS);
            }
            libc::dup2(fd, target);
            libc::close(fd);
        }

        libc::execvp(command.program.as_ptr(), command.argv_ptrs.as_ptr());
        write_stderr(&command.exec_error);
        libc::_exit(EXEC_FAILED_STATUS)
    }
}

/// Copy `fd` above the standard streams (close-on-exec) unless it already is.
/// The original stays as is if the copy fails.
unsafe fn lift_fd(fd: RawFd) -> RawFd {
    if fd > libc::STDERR_FILENO {
        return fd;
    }
    match libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1) {
        moved if moved >= 0 => moved,
        _ => fd,
    }
}

/// Point `target` at `fd`. Our descriptors are close-on-exec, so when they
/// still coincide the flag has to be cleared by hand.
unsafe fn redirect_fd(fd: RawFd, target: RawFd) {
    if fd == target {
        libc::fcntl(fd, libc::F_SETFD, 0);
    } else {
        libc::dup2(fd, target);
    }
}

unsafe fn write_stderr(message: &[u8]) {
    libc::write(
        libc::STDERR_FILENO,
        message.as_ptr() as *const libc::c_void,
        message.len(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Redirection;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_prepare_rejects_empty_argv() {
        let err = PreparedCommand::new(&CommandSpec::default()).err().unwrap();
        assert!(matches!(err, JobError::InvalidCommand { .. }));
    }

    #[test]
    fn test_prepare_rejects_nul_bytes() {
        let spec = CommandSpec::new(["echo", "a\0b"]);
        assert!(PreparedCommand::new(&spec).is_err());

        let spec = CommandSpec::new(["cat"]).redirect(Redirection::input("bad\0path"));
        assert!(PreparedCommand::new(&spec).is_err());
    }

    #[test]
    fn test_lift_fd_moves_standard_streams() {
        let (read, _write) = crate::capture::cloexec_pipe().unwrap();
        let high = read.as_raw_fd();
        assert!(high > 2);
        assert_eq!(unsafe { lift_fd(high) }, high);

        if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFD) } < 0 {
            return;
        }
        let lifted = unsafe { lift_fd(libc::STDIN_FILENO) };
        assert!(lifted > 2);
        let flags = unsafe { libc::fcntl(lifted, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        unsafe { libc::close(lifted) };
    }

    #[test]
    fn test_prepare_builds_null_terminated_argv() {
        let spec = CommandSpec::new(["ls", "-l", "/tmp"]);
        let prepared = PreparedCommand::new(&spec).unwrap();
        assert_eq!(prepared.argv_ptrs.len(), 4);
        assert!(prepared.argv_ptrs[3].is_null());
        assert_eq!(prepared.program().to_str().unwrap(), "ls");
    }
}
