//! Command Runner - execute external tools under admission control and timeout

pub mod process;

pub use process::{JobProcesses, ProcessEntry};

use crate::config::ReconConfig;
use crate::{ReconError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as AsyncCommand;
use tokio::sync::{Mutex, Semaphore};

const TRUNCATION_MARKER: &str = "\n[OUTPUT TRUNCATED - SIZE LIMIT EXCEEDED]\n";

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// The process exited; `None` when it was ended by a signal
    Exited(Option<i32>),
    /// The timeout expired and the process group was killed
    TimedOut,
    /// Dry-run: nothing was spawned
    NotExecuted,
}

/// Outcome of one command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub status: CommandStatus,
    /// stdout and stderr, interleaved in the order lines arrived
    pub output: String,
    pub truncated: bool,
    pub duration: Duration,
}

impl CommandOutput {
    fn not_executed(command: &str) -> Self {
        Self {
            command: command.to_string(),
            status: CommandStatus::NotExecuted,
            output: String::new(),
            truncated: false,
            duration: Duration::ZERO,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.status == CommandStatus::TimedOut
    }

    /// Exit code zero. Informational only: many tools exit non-zero on
    /// "nothing found".
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited(Some(0))
    }
}

/// Runner statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStats {
    pub total_commands: usize,
    pub nonzero_exits: usize,
    pub timeouts: usize,
    pub launch_failures: usize,
    pub not_executed: usize,
    pub peak_in_flight: usize,
}

/// Accumulates captured output up to a size limit.
#[derive(Debug)]
struct OutputCapture {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.truncated || bytes.is_empty() {
            return;
        }
        if self.text.len() + bytes.len() > self.limit {
            self.text.push_str(TRUNCATION_MARKER);
            self.truncated = true;
            return;
        }
        self.text.push_str(&String::from_utf8_lossy(bytes));
    }
}

/// Bytes read from each pipe that have not yet reached a newline
#[derive(Default)]
struct PendingLines {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl PendingLines {
    /// Move partial lines into `capture`, stdout first.
    fn flush_into(&mut self, capture: &mut OutputCapture) {
        for line in [&mut self.stdout, &mut self.stderr] {
            capture.push(line);
            line.clear();
        }
    }
}

/// Decrements the in-flight counter on every exit path.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs shell command lines with a global ceiling on concurrent processes.
///
/// Clones share the semaphore and counters, so one runner built at startup
/// bounds every job of the run.
pub struct CommandRunner {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    stats: Arc<Mutex<RunnerStats>>,
    shell: String,
    dry_run: bool,
    max_output: usize,
}

impl CommandRunner {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            ceiling: max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(Mutex::new(RunnerStats::default())),
            shell: "/bin/sh".to_string(),
            dry_run: false,
            max_output: 8 * 1024 * 1024,
        }
    }

    pub fn from_config(config: &ReconConfig) -> Self {
        Self::new(config.max_commands)
            .with_shell(config.shell.clone())
            .with_dry_run(config.dry_run)
            .with_max_output(config.max_output_bytes)
    }

    pub fn with_shell<S: Into<String>>(mut self, shell: S) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Commands currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RunnerStats {
        let mut stats = self.stats.lock().await.clone();
        stats.peak_in_flight = self.peak_in_flight();
        stats
    }

    /// `Run`: execute `command`, optionally writing its output to `sink`.
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
        sink: Option<&Path>,
    ) -> Result<CommandOutput> {
        self.run_tracked(command, timeout, sink, None).await
    }

    /// Like [`run`](Self::run), registering the process group with a job so
    /// the scheduler can suspend or kill it.
    pub async fn run_tracked(
        &self,
        command: &str,
        timeout: Option<Duration>,
        sink: Option<&Path>,
        processes: Option<&JobProcesses>,
    ) -> Result<CommandOutput> {
        info!("Running: {}", command);

        if self.dry_run {
            self.stats.lock().await.not_executed += 1;
            return Ok(CommandOutput::not_executed(command));
        }

        if processes.map(JobProcesses::is_killed).unwrap_or(false) {
            return Err(ReconError::Killed);
        }

        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ReconError::CommandError(format!("Failed to acquire semaphore: {}", e)))?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.peak.fetch_max(current, Ordering::SeqCst);

        let result = self.execute(command, timeout, processes).await;
        drop(guard);

        {
            let mut stats = self.stats.lock().await;
            stats.total_commands += 1;
            match &result {
                Ok(out) if out.timed_out() => stats.timeouts += 1,
                Ok(out) if !out.success() => stats.nonzero_exits += 1,
                Ok(_) => {}
                Err(ReconError::Killed) => {}
                Err(_) => stats.launch_failures += 1,
            }
        }

        let output = result?;

        if let Some(sink) = sink {
            if let Some(parent) = sink.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(sink, output.output.as_bytes()).await?;
        }

        Ok(output)
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        processes: Option<&JobProcesses>,
    ) -> Result<CommandOutput> {
        let start = Instant::now();

        let mut std_cmd = std::process::Command::new(&self.shell);
        std_cmd
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut child = AsyncCommand::from(std_cmd)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ReconError::CommandError(format!("Failed to launch '{}': {}", command, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| ReconError::CommandError("Process exited before it was tracked".to_string()))?;

        let _registration = match processes {
            Some(p) => Some(p.register(pid, command)?),
            None => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReconError::CommandError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ReconError::CommandError("Failed to capture stderr".to_string()))?;

        let mut capture = OutputCapture::new(self.max_output);
        let mut pending = PendingLines::default();

        let finished = {
            let run = async {
                collect_output(stdout, stderr, &mut capture, &mut pending).await;
                child.wait().await
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let status = match finished {
            Some(exit) => {
                let exit = exit.map_err(|e| {
                    ReconError::CommandError(format!("Failed to wait for '{}': {}", command, e))
                })?;
                CommandStatus::Exited(exit.code())
            }
            None => {
                warn!(
                    "Command timed out after {:?}, killing process group {}: {}",
                    timeout.unwrap_or_default(),
                    pid,
                    command
                );
                process::signal_group(pid, process::SIGKILL);
                let _ = child.start_kill();
                let _ = child.wait().await;
                CommandStatus::TimedOut
            }
        };
        pending.flush_into(&mut capture);

        if processes.map(JobProcesses::is_killed).unwrap_or(false) {
            return Err(ReconError::Killed);
        }

        if let CommandStatus::Exited(code) = status {
            if code != Some(0) {
                debug!("'{}' exited with {:?}", command, code);
            }
        }

        Ok(CommandOutput {
            command: command.to_string(),
            status,
            output: capture.text,
            truncated: capture.truncated,
            duration: start.elapsed(),
        })
    }
}

impl Clone for CommandRunner {
    fn clone(&self) -> Self {
        Self {
            semaphore: Arc::clone(&self.semaphore),
            ceiling: self.ceiling,
            in_flight: Arc::clone(&self.in_flight),
            peak: Arc::clone(&self.peak),
            stats: Arc::clone(&self.stats),
            shell: self.shell.clone(),
            dry_run: self.dry_run,
            max_output: self.max_output,
        }
    }
}

/// Drain both pipes, appending whole lines in the order they arrive.
/// A line cut short by cancellation stays in `pending`.
async fn collect_output<O, E>(
    stdout: O,
    stderr: E,
    capture: &mut OutputCapture,
    pending: &mut PendingLines,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut pending.stdout), if out_open => {
                capture.push(&pending.stdout);
                pending.stdout.clear();
                out_open = matches!(read, Ok(n) if n > 0);
            }
            read = stderr.read_until(b'\n', &mut pending.stderr), if err_open => {
                capture.push(&pending.stderr);
                pending.stderr.clear();
                err_open = matches!(read, Ok(n) if n > 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_truncates_once() {
        let mut capture = OutputCapture::new(8);
        capture.push(b"1234\n");
        capture.push(b"56789\n");
        capture.push(b"more\n");
        assert!(capture.truncated);
        assert_eq!(capture.text, format!("1234\n{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_pending_lines_flush_partial_output() {
        let mut capture = OutputCapture::new(64);
        let mut pending = PendingLines::default();
        pending.stdout.extend_from_slice(b"progress 42%");
        pending.flush_into(&mut capture);
        assert_eq!(capture.text, "progress 42%");
        assert!(pending.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() {
        let runner = CommandRunner::new(1).with_dry_run(true);
        let out = runner.run("exit 3", None, None).await.unwrap();
        assert_eq!(out.status, CommandStatus::NotExecuted);
        assert_eq!(runner.stats().await.not_executed, 1);
        assert_eq!(runner.peak_in_flight(), 0);
    }
}
