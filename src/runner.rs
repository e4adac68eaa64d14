//! Subprocess execution with CPU affinity and a wall-clock limit.
//!
//! An [`Invocation`] describes one process launch. Running it captures stdout and stderr on
//! reader threads while the calling thread supervises the child: it polls liveness every
//! 100ms and, once the deadline passes, sends `SIGTERM` to the child's process group, waits a
//! grace period, then sends `SIGKILL`.
//!
//! The deadline covers the whole process group, not only the child. Descendants still holding
//! the output pipes when it passes are stopped the same way, and the run counts as timed out.
//! Whatever is left of the group once the output is collected is killed.
//!
//! Affinity is applied the same way everywhere in this crate: by prefixing the command with
//! `taskset -c <cpu list>`.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use tracing::{debug, instrument, trace, warn};

use crate::cores::CoreSet;

/// A process to launch.
#[derive(Debug, Clone)]
pub struct Invocation {
    command: String,
    args: Vec<String>,
    affinity: Option<CoreSet>,
    timeout: Duration,
    grace: Duration,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    merge_stderr: bool,
}

impl Invocation {
    /// Used when no timeout is given.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Time left to the process between `SIGTERM` and `SIGKILL`.
    pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);
    const POLL_INTERVAL: Duration = Duration::from_millis(100);
    const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Prepares `command` with no arguments, no affinity and the default timeout.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            affinity: None,
            timeout: Self::DEFAULT_TIMEOUT,
            grace: Self::TERMINATION_GRACE,
            cwd: None,
            envs: vec![],
            merge_stderr: false,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pins the process to `cores`. `None` leaves the scheduler free.
    pub fn affinity(mut self, cores: Option<CoreSet>) -> Self {
        self.affinity = cores.filter(|c| !c.is_empty());
        self
    }

    /// Wall-clock limit. `Duration::MAX` means no limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the `SIGTERM` to `SIGKILL` grace period.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Working directory of the child.
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// When set, stderr text is appended to stdout and `stderr` is left empty.
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    /// The full argv, including the `taskset` prefix when an affinity is set.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = vec![];
        if let Some(cores) = &self.affinity {
            argv.push("taskset".to_string());
            argv.push("-c".to_string());
            argv.push(cores.to_string());
        }
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Launches the process and waits for it, enforcing the timeout.
    ///
    /// # Errors
    ///
    /// Only when the process cannot be started or waited for. A crash, a non-zero exit code or
    /// a timeout is reported through the returned [`ExecutionOutcome`].
    #[instrument(skip_all, fields(command = %self.command))]
    pub fn run(&self) -> anyhow::Result<ExecutionOutcome> {
        let argv = self.command_line();
        debug!(?argv, timeout = ?self.timeout, cwd = ?self.cwd);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group, so that a timeout also reaches the descendants
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("command '{}' could not be started", argv[0]))?;

        let stdout = child.stdout.take().context("Failed to open stdout")?;
        let stderr = child.stderr.take().context("Failed to open stderr")?;
        let readers = [spawn_reader(stdout), spawn_reader(stderr)];

        let group = child.id();
        let deadline = start.checked_add(self.timeout);
        let (status, child_timed_out) = self.supervise(&mut child, deadline)?;
        let ([stdout, stderr], timed_out) = self.drain(readers, deadline, group, child_timed_out)?;
        let elapsed = start.elapsed();
        signal_process_group(group, KILL);

        let (stdout, stderr) = if timed_out {
            // partial output of a killed process is never scored
            trace!(stdout_len = stdout.len(), "discarding output of timed out process");
            (String::new(), String::new())
        } else if self.merge_stderr {
            (stdout + &stderr, String::new())
        } else {
            (stdout, stderr)
        };

        let outcome = ExecutionOutcome {
            exit_code: status.code(),
            signal: termination_signal(&status),
            stdout,
            stderr,
            elapsed,
            timed_out,
        };
        debug!(
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            elapsed = ?outcome.elapsed,
            timed_out
        );
        Ok(outcome)
    }

    /// Polls the child until it exits; escalates once the deadline is reached.
    fn supervise(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
    ) -> anyhow::Result<(ExitStatus, bool)> {
        loop {
            if let Some(status) = child.try_wait().context("failed to poll child process")? {
                return Ok((status, false));
            }
            let now = Instant::now();
            match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => thread::sleep(Self::POLL_INTERVAL.min(deadline - now)),
                None => thread::sleep(Self::POLL_INTERVAL),
            }
        }

        warn!(
            pid = child.id(),
            timeout = ?self.timeout,
            "process timed out, terminating"
        );
        terminate(child);

        let grace_deadline = Instant::now() + self.grace;
        while Instant::now() < grace_deadline {
            if let Some(status) = child.try_wait().context("failed to poll child process")? {
                return Ok((status, true));
            }
            thread::sleep(Self::GRACE_POLL_INTERVAL);
        }

        warn!(pid = child.id(), "process did not terminate gracefully, killing");
        kill(child);
        let status = child.wait().context("failed to wait for killed process")?;
        Ok((status, true))
    }

    /// Collects stdout and stderr once the child is gone.
    ///
    /// Pipes still open at the deadline mean a descendant outlived the child: the group gets
    /// `SIGTERM`, then `SIGKILL` after the grace period, and the run is reported as timed out.
    fn drain(
        &self,
        readers: [Receiver<io::Result<Vec<u8>>>; 2],
        deadline: Option<Instant>,
        group: u32,
        mut timed_out: bool,
    ) -> anyhow::Result<([String; 2], bool)> {
        let mut captured = [String::new(), String::new()];
        for (slot, reader) in captured.iter_mut().zip(readers) {
            let mut received = match deadline {
                _ if timed_out => reader.recv_timeout(self.grace),
                Some(deadline) => {
                    reader.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => reader.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            if matches!(received, Err(RecvTimeoutError::Timeout)) && !timed_out {
                warn!(
                    pgid = group,
                    timeout = ?self.timeout,
                    "output still held by descendants, terminating the process group"
                );
                timed_out = true;
                signal_process_group(group, TERM);
                received = reader.recv_timeout(self.grace);
                if matches!(received, Err(RecvTimeoutError::Timeout)) {
                    warn!(pgid = group, "process group did not terminate gracefully, killing");
                    signal_process_group(group, KILL);
                    received = reader.recv_timeout(self.grace);
                }
            }
            match received {
                Ok(bytes) => {
                    let bytes = bytes.context("could not read process output")?;
                    *slot = String::from_utf8_lossy(&bytes).into_owned();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("output pipe held outside the process group, giving up on it");
                }
                Err(RecvTimeoutError::Disconnected) => bail!("pipe reader thread panicked"),
            }
        }
        Ok((captured, timed_out))
    }
}

/// Converts a `timeout_secs` setting. Zero, negative, NaN and out of range values are refused.
pub fn timeout_from_secs(secs: f64) -> Result<Duration, String> {
    if !(secs > 0.0) {
        return Err(format!("timeout must be positive, got {secs}"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout {secs}: {e}"))
}

/// What happened to one launched process.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Captured standard output (empty after a timeout).
    pub stdout: String,
    /// Captured standard error (empty after a timeout or when merged).
    pub stderr: String,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
    /// The deadline was reached and the process was terminated.
    pub timed_out: bool,
}

impl ExecutionOutcome {
    /// Exited normally with code 0 before the deadline.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Human readable reason for a failed run, `None` when the run succeeded.
    pub fn failure_description(&self) -> Option<String> {
        if self.timed_out {
            return Some("Time Limit Exceeded".to_string());
        }
        if let Some(signal) = self.signal {
            return Some(describe_signal(signal));
        }
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("Process exited with code {code}")),
            None => Some("Process terminated abnormally".to_string()),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let read = pipe.read_to_end(&mut buf).map(|_| buf);
        // the receiver is gone when the harness gave up on this pipe
        let _ = tx.send(read);
    });
    rx
}

#[cfg(unix)]
const TERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERM: i32 = 15;
#[cfg(not(unix))]
const KILL: i32 = 9;

/// Signals the process group led by the (already reaped) child.
#[cfg(unix)]
fn signal_process_group(pgid: u32, signal: i32) {
    // SAFETY: kill(2) has no memory-safety preconditions. Only the group is targeted, never
    // the reaped leader's pid on its own.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc == 0 {
        trace!(pgid, signal, "signalled process group");
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pgid: u32, _signal: i32) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions; the child is not reaped yet so its
    // pid (and process group id) cannot have been recycled.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // SAFETY: same as above
        let _ = unsafe { libc::kill(pid, signal) };
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    kill(child);
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    if let Err(e) = child.kill() {
        debug!("kill after group SIGKILL: {e}");
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn describe_signal(signal: i32) -> String {
    match signal {
        libc::SIGSEGV => "Segmentation fault".to_string(),
        libc::SIGABRT => "Aborted".to_string(),
        libc::SIGFPE => "Floating point exception".to_string(),
        _ => format!("Process terminated by signal {signal}"),
    }
}

#[cfg(not(unix))]
fn describe_signal(signal: i32) -> String {
    format!("Process terminated by signal {signal}")
}
