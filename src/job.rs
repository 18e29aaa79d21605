//! Detached background jobs for event handlers.
//!
//! The agent blocks on each handler invocation, so long-running work has to
//! leave the handler's process tree. [`AsyncJob::start`] forks a daemonized
//! supervisor that runs the command, waits for it, and records progress as
//! JSON in a state file that later invocations can inspect, signal or reap.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const NULL_DEVICE: &str = "/dev/null";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job state io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed job state file: {0}")]
    State(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("unknown signal {0:?}")]
    InvalidSignal(String),
}

/// Result of a job operation, printed as `success` or `failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Success,
    Failed,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failed => "failed",
        }
    }

    pub fn is_success(self) -> bool {
        self == JobOutcome::Success
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// No state file.
    Absent,
    /// Supervisor started, command not yet spawned.
    Invoking,
    Running,
    /// Command exited; see `exitstatus`.
    Finished,
    /// Command could not be spawned; see `error`.
    Failed,
}

/// Contents of a job's state file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    /// Supervisor pid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppid: Option<i32>,
    /// Command pid once spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Unix seconds when the supervisor started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitstatus: Option<i32>,
    /// Signal that terminated the command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termsig: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobState {
    pub fn absent() -> Self {
        Self {
            status: JobStatus::Absent,
            ppid: None,
            pid: None,
            time: None,
            exitstatus: None,
            termsig: None,
            error: None,
        }
    }

    fn invoking(ppid: i32) -> Self {
        Self {
            status: JobStatus::Invoking,
            ppid: Some(ppid),
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|elapsed| elapsed.as_secs()),
            ..Self::absent()
        }
    }
}

/// What to run and where to record it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    /// Shell command, run with `sh -c`.
    pub command: String,
    pub state_file: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Defaults to the null device.
    pub stdout: Option<PathBuf>,
    /// Defaults to the null device.
    pub stderr: Option<PathBuf>,
}

impl JobSpec {
    /// Runs `command` through `sh -c`, tracked by `state_file`.
    pub fn new(command: impl Into<String>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            state_file: state_file.into(),
            working_dir: None,
            env: BTreeMap::new(),
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }
}

/// A background job identified by its state file.
#[derive(Clone, Debug)]
pub struct AsyncJob {
    spec: JobSpec,
}

impl AsyncJob {
    pub fn new(spec: JobSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Launches the job in a detached supervisor and returns once the
    /// supervisor is running. Fails when the state file already exists or
    /// the command is empty.
    ///
    /// May be called from a threaded process, including a tokio runtime.
    /// The forked child never logs, never touches stdio and never enters the
    /// runtime.
    pub fn start(&self) -> Result<JobOutcome, JobError> {
        if self.exists() || self.spec.command.trim().is_empty() {
            warn!(event = "job_start_refused", state_file = %self.spec.state_file.display());
            return Ok(JobOutcome::Failed);
        }

        // SAFETY: the child only makes syscalls, heap allocations and the
        // environment read inside `Command::spawn`. libc's fork handlers reset
        // the allocator for the child. This crate never writes the environment,
        // so no parent thread can hold that lock exclusively at fork. The child
        // takes no other lock.
        match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => {
                waitpid(child, None)?;
                info!(event = "job_started", command = %self.spec.command, state_file = %self.spec.state_file.display());
                Ok(JobOutcome::Success)
            }
            ForkResult::Child => {
                let code = match unistd::daemon(true, false) {
                    Ok(()) => supervise(&self.spec),
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
        }
    }

    /// Sends `signal` (`"KILL"`, `"SIGTERM"`, `"15"`) to the running command.
    pub fn kill(&self, signal: &str) -> Result<JobOutcome, JobError> {
        let signal = parse_signal(signal)?;
        let state = self.state_info()?;
        let Some(pid) = state.pid.filter(|pid| *pid > 0) else {
            return Ok(JobOutcome::Failed);
        };
        if !process_exists(pid) {
            debug!(event = "job_kill_not_running", pid);
            return Ok(JobOutcome::Failed);
        }
        match signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                info!(event = "job_signalled", pid, signal = %signal);
                Ok(JobOutcome::Success)
            }
            Err(err) => {
                warn!(event = "job_kill_failed", pid, signal = %signal, error = %err);
                Ok(JobOutcome::Failed)
            }
        }
    }

    pub fn state_info(&self) -> Result<JobState, JobError> {
        match fs::read(&self.spec.state_file) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(JobState::absent()),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the state file of a finished job.
    pub fn reap(&self) -> Result<JobOutcome, JobError> {
        if self.state_info()?.status != JobStatus::Finished {
            return Ok(JobOutcome::Failed);
        }
        fs::remove_file(&self.spec.state_file)?;
        info!(event = "job_reaped", state_file = %self.spec.state_file.display());
        Ok(JobOutcome::Success)
    }

    fn exists(&self) -> bool {
        self.spec.state_file.exists()
    }
}

/// Supervisor body, run in the daemonized child. Returns its exit code.
fn supervise(spec: &JobSpec) -> i32 {
    let mut state = JobState::invoking(std::process::id() as i32);
    if write_state(&spec.state_file, &state).is_err() {
        return 1;
    }

    match spawn_command(spec) {
        Ok(mut child) => {
            state.pid = Some(child.id() as i32);
            state.status = JobStatus::Running;
            if write_state(&spec.state_file, &state).is_err() {
                return 1;
            }
            match child.wait() {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    state.status = JobStatus::Finished;
                    state.exitstatus = status.code();
                    state.termsig = status.signal();
                }
                Err(err) => {
                    state.status = JobStatus::Failed;
                    state.error = Some(err.to_string());
                }
            }
        }
        Err(err) => {
            state.status = JobStatus::Failed;
            state.error = Some(err.to_string());
        }
    }

    match write_state(&spec.state_file, &state) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn spawn_command(spec: &JobSpec) -> io::Result<std::process::Child> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&spec.command)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(output_file(spec.stdout.as_deref())?)
        .stderr(output_file(spec.stderr.as_deref())?);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    command.spawn()
}

fn output_file(path: Option<&Path>) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.unwrap_or_else(|| Path::new(NULL_DEVICE)))
}

/// Replaces the state file in one rename so readers never see partial JSON.
fn write_state(path: &Path, state: &JobState) -> Result<(), JobError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, serde_json::to_vec(state)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn process_exists(pid: i32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

fn parse_signal(name: &str) -> Result<Signal, JobError> {
    let trimmed = name.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| JobError::InvalidSignal(name.to_string()));
    }
    let upper = trimmed.to_ascii_uppercase();
    let qualified = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&qualified).map_err(|_| JobError::InvalidSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use super::*;

    fn wait_for_status(job: &AsyncJob, wanted: JobStatus) -> JobState {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(state) = job.state_info() {
                if state.status == wanted {
                    return state;
                }
            }
            assert!(Instant::now() < deadline, "job never reached {wanted:?}");
            thread::sleep(Duration::from_millis(25));
        }
    }

    #[test]
    fn absent_state_file_reports_absent() {
        let dir = TempDir::new().expect("tempdir");
        let job = AsyncJob::new(JobSpec::new("true", dir.path().join("state.json")));
        assert_eq!(job.state_info().expect("state"), JobState::absent());
        assert_eq!(job.reap().expect("reap"), JobOutcome::Failed);
        assert_eq!(job.kill("KILL").expect("kill"), JobOutcome::Failed);
    }

    #[test]
    fn start_refuses_existing_state_or_empty_command() {
        let dir = TempDir::new().expect("tempdir");
        let state_file = dir.path().join("state.json");

        let empty = AsyncJob::new(JobSpec::new("  ", &state_file));
        assert_eq!(empty.start().expect("start"), JobOutcome::Failed);

        fs::write(&state_file, br#"{"status":"running","pid":1}"#).expect("seed state");
        let busy = AsyncJob::new(JobSpec::new("true", &state_file));
        assert_eq!(busy.start().expect("start"), JobOutcome::Failed);
    }

    #[test]
    fn job_runs_to_completion_and_can_be_reaped() {
        let dir = TempDir::new().expect("tempdir");
        let stdout = dir.path().join("out.log");
        let spec = JobSpec::new("echo \"$GREETING\" && pwd && exit 3", dir.path().join("state.json"))
            .with_env("GREETING", "hello")
            .with_working_dir(dir.path())
            .with_stdout(&stdout);
        let job = AsyncJob::new(spec);

        assert_eq!(job.start().expect("start"), JobOutcome::Success);
        let state = wait_for_status(&job, JobStatus::Finished);
        assert_eq!(state.exitstatus, Some(3));
        assert!(state.pid.is_some());
        assert!(state.ppid.is_some());

        let output = fs::read_to_string(&stdout).expect("stdout");
        assert!(output.starts_with("hello\n"), "unexpected output {output:?}");

        assert_eq!(job.reap().expect("reap"), JobOutcome::Success);
        assert_eq!(job.state_info().expect("state").status, JobStatus::Absent);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn running_job_can_be_signalled() {
        let dir = TempDir::new().expect("tempdir");
        let job = AsyncJob::new(JobSpec::new("exec sleep 30", dir.path().join("state.json")));

        assert_eq!(job.start().expect("start"), JobOutcome::Success);
        wait_for_status(&job, JobStatus::Running);
        assert_eq!(job.reap().expect("reap"), JobOutcome::Failed);

        assert_eq!(job.kill("term").expect("kill"), JobOutcome::Success);
        let state = wait_for_status(&job, JobStatus::Finished);
        assert_eq!(state.exitstatus, None);
        assert_eq!(state.termsig, Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn signal_names_are_normalized() {
        assert_eq!(parse_signal("KILL").expect("kill"), Signal::SIGKILL);
        assert_eq!(parse_signal("sigterm").expect("term"), Signal::SIGTERM);
        assert_eq!(parse_signal("9").expect("nine"), Signal::SIGKILL);
        assert!(matches!(
            parse_signal("NOPE"),
            Err(JobError::InvalidSignal(_))
        ));
    }

    #[test]
    fn outcomes_print_as_words() {
        assert_eq!(JobOutcome::Success.to_string(), "success");
        assert_eq!(JobOutcome::Failed.to_string(), "failed");
    }

    #[test]
    fn state_file_uses_lowercase_status() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut state = JobState::invoking(42);
        state.status = JobStatus::Running;
        state.pid = Some(43);
        write_state(&path, &state).expect("write");

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(raw["status"], "running");
        assert_eq!(raw["ppid"], 42);
        assert_eq!(raw["pid"], 43);
        assert!(raw.get("exitstatus").is_none());
    }
}
