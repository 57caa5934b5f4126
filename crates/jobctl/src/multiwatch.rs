//! multiWatch sessions
//!
//! `multiWatch ["cmd1", "cmd2"]` re-runs each command on an interval and
//! shows its latest output. Every command gets one watcher process group
//! (`/bin/sh` looping over the command) writing into a private temp
//! directory; [`MultiWatch::poll_output`] reports a command whenever its
//! output file changes. Dropping the session kills the watchers and removes
//! the directory.

use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::JobControlConfig;
use crate::wait::signal_group;
use crate::{JobError, Result};

/// Most commands one session watches.
pub const MAX_WATCH_COMMANDS: usize = 16;

/// Longest command accepted from a `multiWatch` line, in bytes.
pub const MAX_WATCH_COMMAND_LEN: usize = 511;

const KEYWORD: &str = "multiWatch";
const SEPARATOR: &str = "----------------------------------------------------";

// Output is written to a sibling file and renamed so readers never see a
// half-written run.
const WATCH_LOOP: &str =
    r#"while :; do /bin/sh -c "$1" > "$2.tmp" 2>&1; mv -f "$2.tmp" "$2"; sleep "$3"; done"#;

// ============================================================================
// Command line
// ============================================================================

/// True if `line` starts with the `multiWatch` keyword.
pub fn is_multiwatch_command(line: &str) -> bool {
    line.trim_start().starts_with(KEYWORD)
}

/// Parse `multiWatch ["a", 'b', ...]` into its quoted commands.
///
/// Items are single- or double-quoted and separated by commas or spaces.
/// Empty and over-long items are skipped and at most
/// [`MAX_WATCH_COMMANDS`] are kept. Returns `None` for malformed input or
/// when nothing is left.
pub fn parse_watch_list(line: &str) -> Option<Vec<String>> {
    let rest = line.trim_start().strip_prefix(KEYWORD)?;
    let mut chars = rest[rest.find('[')? + 1..].chars();
    let mut commands = Vec::new();

    while commands.len() < MAX_WATCH_COMMANDS {
        let quote = loop {
            match chars.next() {
                Some(c) if c.is_whitespace() || c == ',' => continue,
                Some(c @ ('"' | '\'')) => break c,
                Some(']') | None => return (!commands.is_empty()).then_some(commands),
                Some(_) => return None,
            }
        };

        let mut item = String::new();
        loop {
            match chars.next() {
                Some(c) if c == quote => break,
                Some(c) => item.push(c),
                None => return None,
            }
        }
        if !item.is_empty() && item.len() <= MAX_WATCH_COMMAND_LEN {
            commands.push(item);
        }
    }

    (!commands.is_empty()).then_some(commands)
}

// ============================================================================
// Updates
// ============================================================================

/// Latest output of one watched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchUpdate {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub output: String,
}

impl fmt::Display for WatchUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\"{}\", current_time: {}",
            self.command,
            self.timestamp.timestamp()
        )?;
        writeln!(f, "{}", SEPARATOR)?;
        f.write_str(&self.output)?;
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            writeln!(f)?;
        }
        writeln!(f, "{}", SEPARATOR)
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug)]
struct Watcher {
    command: String,
    child: Child,
    output: PathBuf,
    last: Option<Vec<u8>>,
}

/// A running multiWatch session.
#[derive(Debug)]
pub struct MultiWatch {
    dir: TempDir,
    watchers: Vec<Watcher>,
    max_output: usize,
}

impl MultiWatch {
    /// Start one watcher per command.
    pub fn start<I, S>(commands: I, config: &JobControlConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dir = tempfile::Builder::new()
            .prefix("jobctl-watch.")
            .tempdir()
            .map_err(|e| JobError::spawn_failed(format!("watch directory: {}", e)))?;
        let interval = format_interval(config.watch_interval());

        let mut session = Self {
            dir,
            watchers: Vec::new(),
            max_output: config.output_capacity,
        };

        for (index, command) in commands.into_iter().enumerate() {
            let command = command.into();
            let output = session.dir.path().join(format!("{}.out", index));
            let child = spawn_watcher(&command, &output, &interval)?;
            debug!(pid = child.id(), command = %command, "multiwatch.start");
            session.watchers.push(Watcher {
                command,
                child,
                output,
                last: None,
            });
        }

        if session.watchers.is_empty() {
            return Err(JobError::invalid_command("multiWatch needs at least one command"));
        }
        Ok(session)
    }

    /// Parse a `multiWatch [...]` line and start it.
    pub fn from_command_line(line: &str, config: &JobControlConfig) -> Result<Self> {
        let commands = parse_watch_list(line).ok_or_else(|| {
            JobError::invalid_command(r#"usage: multiWatch ["cmd1", "cmd2", ...]"#)
        })?;
        Self::start(commands, config)
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.watchers.iter().map(|w| w.command.as_str())
    }

    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    /// Report every command whose output changed since the last poll.
    /// Never blocks; returns the number of updates delivered.
    pub fn poll_output<F>(&mut self, mut callback: F) -> usize
    where
        F: FnMut(WatchUpdate),
    {
        let mut delivered = 0;
        for watcher in &mut self.watchers {
            let mut bytes = match std::fs::read(&watcher.output) {
                Ok(bytes) => bytes,
                // Not produced yet.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %watcher.output.display(), error = %e, "multiwatch.read failed");
                    continue;
                }
            };
            bytes.truncate(self.max_output);
            if watcher.last.as_deref() == Some(bytes.as_slice()) {
                continue;
            }

            callback(WatchUpdate {
                command: watcher.command.clone(),
                timestamp: Utc::now(),
                output: String::from_utf8_lossy(&bytes).into_owned(),
            });
            watcher.last = Some(bytes);
            delivered += 1;
        }
        delivered
    }
}

impl Drop for MultiWatch {
    fn drop(&mut self) {
        for watcher in &mut self.watchers {
            let pgid = Pid::from_raw(watcher.child.id() as i32);
            if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
                warn!(pgid = %pgid, error = %e, "multiwatch.stop");
            }
            if let Err(e) = watcher.child.wait() {
                warn!(pgid = %pgid, error = %e, "multiwatch.stop: wait failed");
            }
        }
        debug!(count = self.watchers.len(), "multiwatch.stop");
    }
}

fn spawn_watcher(command: &str, output: &Path, interval: &str) -> Result<Child> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(WATCH_LOOP)
        .arg("jobctl-watch")
        .arg(command)
        .arg(output)
        .arg(interval)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| JobError::spawn_failed(format!("watcher for {:?}: {}", command, e)))
}

/// `sleep` operand: whole seconds, or seconds with millisecond fraction.
fn format_interval(interval: Duration) -> String {
    let millis = interval.subsec_millis();
    if millis == 0 {
        interval.as_secs().to_string()
    } else {
        format!("{}.{:03}", interval.as_secs(), millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_is_multiwatch_command() {
        assert!(is_multiwatch_command("  multiWatch [\"ls\"]"));
        assert!(!is_multiwatch_command("watch ls"));
    }

    #[test]
    fn test_parse_watch_list() {
        let parsed = parse_watch_list(r#"multiWatch ["date", 'uptime' , "ls -l"]"#).unwrap();
        assert_eq!(parsed, vec!["date", "uptime", "ls -l"]);
    }

    #[test]
    fn test_parse_watch_list_rejects_malformed() {
        assert_eq!(parse_watch_list("multiWatch date"), None);
        assert_eq!(parse_watch_list("multiWatch [date]"), None);
        assert_eq!(parse_watch_list(r#"multiWatch ["date"#), None);
        assert_eq!(parse_watch_list("multiWatch []"), None);
        assert_eq!(parse_watch_list(r#"multiWatch ["", ""]"#), None);
        assert_eq!(parse_watch_list(r#"ls ["date"]"#), None);
    }

    #[test]
    fn test_parse_watch_list_caps_count() {
        let items: Vec<String> = (0..20).map(|i| format!("\"echo {}\"", i)).collect();
        let line = format!("multiWatch [{}]", items.join(", "));
        assert_eq!(parse_watch_list(&line).unwrap().len(), MAX_WATCH_COMMANDS);
    }

    #[test]
    fn test_update_display() {
        let update = WatchUpdate {
            command: "date".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            output: "hello".into(),
        };
        let expected = format!(
            "\"date\", current_time: 1700000000\n{sep}\nhello\n{sep}\n",
            sep = SEPARATOR
        );
        assert_eq!(update.to_string(), expected);
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(Duration::from_secs(1)), "1");
        assert_eq!(format_interval(Duration::from_millis(50)), "0.050");
    }

    #[test]
    fn test_session_reports_output_and_cleans_up() {
        let config = JobControlConfig {
            watch_interval_ms: 50,
            ..JobControlConfig::default()
        };
        let mut session = MultiWatch::start(["echo one", "echo two"], &config).unwrap();
        assert_eq!(session.len(), 2);
        let dir = session.directory().to_path_buf();

        let mut updates = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while updates.len() < 2 && Instant::now() < deadline {
            session.poll_output(|u| updates.push(u));
            std::thread::sleep(Duration::from_millis(20));
        }
        updates.sort_by(|a, b| a.command.cmp(&b.command));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].output, "one\n");
        assert_eq!(updates[1].output, "two\n");

        // Unchanged output is not reported again.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(session.poll_output(|_| {}), 0);

        drop(session);
        assert!(!dir.exists());
    }
}
