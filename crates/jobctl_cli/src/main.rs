//! jobctl - a small job-control shell on top of the `jobctl` engine
//!
//! ```text
//! jobctl [--config <path>] [-c <command line>]
//! ```
//!
//! Builtins: `jobs`, `fg [n]`, `bg [n]`, `multiWatch ["cmd", ...]`, `exit`.
//!
//! # Environment Variables
//!
//! - `JOBCTL_LOG` - Log filter (default: "warn")
//! - `JOBCTL_CONFIG` - Config file used when `--config` is not given
//!
//! Without either, `~/.jobctl/config.toml` is read if it exists.

use anyhow::{anyhow, bail, Context, Result};
use std::{
    env,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::mpsc,
    thread,
    time::Duration,
};

use jobctl::{
    CapturedOutput, Completion, EventHook, ForegroundJob, JobControl, JobControlConfig, JobId,
    MultiWatch, TerminalOwnership,
};
use tracing::debug;

mod parse;

fn usage() {
    eprintln!("jobctl [--config <path>] [-c <command line>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Read engine settings from a TOML file");
    eprintln!("  -c <line>         Run one command line and exit with its status");
    eprintln!("  -h, --help        Show this help");
    eprintln!();
    eprintln!("Builtins:");
    eprintln!("  jobs              List background jobs");
    eprintln!("  fg [n]            Continue job n in the foreground");
    eprintln!("  bg [n]            Continue job n in the background");
    eprintln!("  multiWatch [...]  Re-run quoted commands until Enter is pressed");
    eprintln!("  exit              Leave the shell");
}

/// Config lookup order: `--config`, `$JOBCTL_CONFIG`, `~/.jobctl/config.toml`.
fn load_config(explicit: Option<PathBuf>) -> Result<JobControlConfig> {
    let path = explicit
        .or_else(|| env::var_os("JOBCTL_CONFIG").map(PathBuf::from))
        .or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".jobctl").join("config.toml"))
                .filter(|p| p.exists())
        });

    match path {
        Some(path) => {
            debug!(path = %path.display(), "config.load");
            JobControlConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))
        }
        None => Ok(JobControlConfig::default()),
    }
}

/// Reports stops while a job runs; Ctrl-C and Ctrl-Z reach the job's group
/// straight from the terminal.
struct ReplHook;

impl EventHook for ReplHook {
    fn process_events(&mut self, _job: &ForegroundJob<'_>) {}

    fn job_stopped(&mut self, job_id: Option<JobId>, command: &str) {
        match job_id {
            Some(id) => eprintln!("\n[{}]+ {:<24}{}", id, "Stopped", command),
            None => eprintln!("\njobctl: job table full, '{}' left running untracked", command),
        }
    }
}

fn print_output(output: &CapturedOutput) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(&output.bytes)?;
    stdout.flush()?;
    if output.truncated {
        eprintln!("jobctl: output truncated");
    }
    Ok(())
}

fn exit_status(output: &CapturedOutput) -> i32 {
    match output.completion {
        Completion::Exited(code) => code,
        Completion::Signaled(sig) => 128 + sig as i32,
        Completion::Stopped(_) | Completion::StoppedUntracked => 0,
    }
}

/// Job named by a `fg`/`bg` argument, or the most recent job.
fn pick_job(control: &JobControl, arg: Option<&str>) -> Result<JobId> {
    match arg {
        Some(text) => {
            let n: u32 = text
                .trim_start_matches('%')
                .parse()
                .map_err(|_| anyhow!("bad job number: {}", text))?;
            Ok(JobId::new(n))
        }
        None => control
            .list_jobs()
            .last()
            .map(|job| job.job_id)
            .ok_or_else(|| anyhow!("no current job")),
    }
}

fn run_line(control: &mut JobControl, line: &str) -> Result<CapturedOutput> {
    let stages = parse::parse_line(line).map_err(|e| anyhow!(e))?;
    let mut hook = ReplHook;
    let output = if stages.len() == 1 {
        control.execute(&stages[0], Some(&mut hook))?
    } else {
        control.execute_pipeline(&stages, Some(&mut hook))?
    };
    print_output(&output)?;
    Ok(output)
}

/// Show watch output until a line arrives on stdin.
fn run_multiwatch(control: &JobControl, line: &str) -> Result<()> {
    let mut session = MultiWatch::from_command_line(line, control.config())?;
    eprintln!("jobctl: watching {} command(s), press Enter to stop", session.len());

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut discard = String::new();
        let _ = io::stdin().lock().read_line(&mut discard);
        let _ = tx.send(());
    });

    while rx.try_recv().is_err() {
        session.poll_output(|update| print!("{}", update));
        io::stdout().flush()?;
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Returns false when the shell should exit.
fn dispatch(control: &mut JobControl, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("exit") => return Ok(false),
        Some("jobs") => {
            for job in control.list_jobs() {
                println!("{}", job);
            }
        }
        Some("fg") => {
            let job_id = pick_job(control, words.next())?;
            let mut hook = ReplHook;
            let output = control.continue_in_foreground(job_id, Some(&mut hook))?;
            print_output(&output)?;
        }
        Some("bg") => {
            let job_id = pick_job(control, words.next())?;
            control.resume_job(job_id)?;
        }
        Some(_) if jobctl::multiwatch::is_multiwatch_command(line) => {
            run_multiwatch(control, line)?;
        }
        Some(_) => {
            run_line(control, line)?;
        }
    }
    Ok(true)
}

fn repl(control: &mut JobControl) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        control.poll_background_jobs(|event| println!("{}", event));

        print!("jobctl$ ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }

        match dispatch(control, line.trim()) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => eprintln!("jobctl: {:#}", e),
        }
    }
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("JOBCTL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut config_path = None;
    let mut command = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow!("--config requires a value"))?;
                config_path = Some(PathBuf::from(value));
                i += 2;
            }
            "-c" => {
                let value = args.get(i + 1).ok_or_else(|| anyhow!("-c requires a value"))?;
                command = Some(value.clone());
                i += 2;
            }
            "-h" | "--help" => {
                usage();
                return Ok(());
            }
            other => {
                usage();
                bail!("Unknown argument: {}", other);
            }
        }
    }

    let config = load_config(config_path)?;
    let terminal = TerminalOwnership::capture();
    let mut control = JobControl::new(config, terminal)?;

    match command {
        Some(line) => {
            let status = exit_status(&run_line(&mut control, &line)?);
            drop(control);
            std::process::exit(status);
        }
        None => repl(&mut control),
    }
}
