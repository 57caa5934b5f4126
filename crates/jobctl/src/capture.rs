//! Output capture
//!
//! A capped, owned byte buffer and the read end of the capture pipe.
//! Bytes past the cap are read and dropped, so writers never stall on a
//! full pipe, and the result is flagged as truncated.

use std::borrow::Cow;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::Signal;

use crate::types::JobId;
use crate::Result;

/// Byte buffer with a fixed capacity; overflow is dropped deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
            truncated: false,
        }
    }

    /// Append as much of `data` as fits. Returns the number of bytes kept.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let room = self.capacity - self.bytes.len();
        let kept = data.len().min(room);
        self.bytes.extend_from_slice(&data[..kept]);
        if kept < data.len() {
            self.truncated = true;
        }
        kept
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.bytes, self.truncated)
    }
}

/// How a foreground job left the wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every member exited; the status of the last stage.
    Exited(i32),
    /// The last stage was killed by a signal.
    Signaled(Signal),
    /// The job stopped and was parked as a background job.
    Stopped(JobId),
    /// The job stopped but the background table was full.
    StoppedUntracked,
}

/// Result of a foreground execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub completion: Completion,
}

impl CapturedOutput {
    pub fn new(buffer: CaptureBuffer, completion: Completion) -> Self {
        let (bytes, truncated) = buffer.into_parts();
        Self {
            bytes,
            truncated,
            completion,
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.completion {
            Completion::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn stopped_job(&self) -> Option<JobId> {
        match self.completion {
            Completion::Stopped(id) => Some(id),
            _ => None,
        }
    }
}

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Create a pipe whose both ends are close-on-exec.
///
/// Ends that a child needs are dup'ed onto 0/1/2, which clears the flag;
/// every other copy disappears at exec, so EOF propagates as soon as the
/// real writers are gone.
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "illumos",
        target_os = "solaris"
    ))]
    {
        Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "illumos",
        target_os = "solaris"
    )))]
    {
        use nix::fcntl::FdFlag;
        let (read, write) = nix::unistd::pipe()?;
        for fd in [&read, &write] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok((read, write))
    }
}

/// Parent's end of the capture pipe.
#[derive(Debug)]
pub struct CapturePipe {
    reader: File,
    scratch: Vec<u8>,
}

impl CapturePipe {
    /// Wrap the read end and switch it to non-blocking mode.
    pub fn new(read_end: OwnedFd, chunk: usize) -> Result<Self> {
        set_nonblocking(&read_end, true)?;
        Ok(Self {
            reader: File::from(read_end),
            scratch: vec![0; chunk.max(1)],
        })
    }

    /// One read of up to a chunk. "Would block" is not an error.
    pub fn read_available(&mut self, buffer: &mut CaptureBuffer) -> Result<ReadOutcome> {
        loop {
            match self.reader.read(&mut self.scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    buffer.push(&self.scratch[..n]);
                    return Ok(ReadOutcome::Data(n));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocking read until every writer has closed the pipe.
    pub fn drain_to_eof(&mut self, buffer: &mut CaptureBuffer) -> Result<()> {
        set_nonblocking(&self.reader, false)?;
        loop {
            match self.reader.read(&mut self.scratch) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    buffer.push(&self.scratch[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn set_nonblocking(fd: &impl AsRawFd, nonblocking: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(raw, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
