//! Process-group bookkeeping for one job
//!
//! Every command is spawned as the leader of its own process group, so a
//! signal sent to the group reaches the shell and everything it started.

use crate::{ReconError, Result};
use chrono::{DateTime, Local};
use log::{debug, warn};
use std::sync::{Mutex, MutexGuard};

#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    rc == 0
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: u32, _signal: i32) -> bool {
    false
}

#[cfg(unix)]
pub(crate) const SIGKILL: libc::c_int = libc::SIGKILL;
#[cfg(unix)]
const SIGSTOP: libc::c_int = libc::SIGSTOP;
#[cfg(unix)]
const SIGCONT: libc::c_int = libc::SIGCONT;

#[cfg(not(unix))]
pub(crate) const SIGKILL: i32 = 9;
#[cfg(not(unix))]
const SIGSTOP: i32 = 19;
#[cfg(not(unix))]
const SIGCONT: i32 = 18;

/// A live external command owned by a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
    pub started: DateTime<Local>,
}

#[derive(Debug, Default)]
struct ProcessGroups {
    entries: Vec<ProcessEntry>,
    suspended: bool,
    killed: bool,
}

/// Process groups currently owned by one job.
///
/// The scheduler suspends, resumes and kills through this handle while the
/// job's commands register and deregister themselves from the runner.
#[derive(Debug, Default)]
pub struct JobProcesses {
    inner: Mutex<ProcessGroups>,
}

impl JobProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProcessGroups> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a freshly spawned group. A group spawned while the job is
    /// suspended is stopped at once; one spawned after a kill is killed.
    pub fn register(&self, pid: u32, command: &str) -> Result<ProcessRegistration<'_>> {
        let mut groups = self.lock();

        if groups.killed {
            signal_group(pid, SIGKILL);
            return Err(ReconError::Killed);
        }

        if groups.suspended {
            debug!("Stopping pid {} spawned while suspended", pid);
            signal_group(pid, SIGSTOP);
        }

        groups.entries.push(ProcessEntry {
            pid,
            command: command.to_string(),
            started: Local::now(),
        });

        Ok(ProcessRegistration { processes: self, pid })
    }

    fn deregister(&self, pid: u32) {
        self.lock().entries.retain(|e| e.pid != pid);
    }

    /// Stop every group. Returns how many groups were signalled.
    pub fn suspend(&self) -> usize {
        let mut groups = self.lock();
        groups.suspended = true;
        groups
            .entries
            .iter()
            .filter(|e| signal_group(e.pid, SIGSTOP))
            .count()
    }

    pub fn resume(&self) -> usize {
        let mut groups = self.lock();
        groups.suspended = false;
        groups
            .entries
            .iter()
            .filter(|e| signal_group(e.pid, SIGCONT))
            .count()
    }

    /// Kill every group. Calling it again, or after the job ended, is a no-op.
    pub fn kill(&self) -> usize {
        let mut groups = self.lock();
        if groups.killed {
            return 0;
        }
        groups.killed = true;
        groups.suspended = false;

        let mut killed = 0;
        for entry in &groups.entries {
            if signal_group(entry.pid, SIGKILL) {
                killed += 1;
            } else {
                warn!("Could not signal process group {}", entry.pid);
            }
        }
        killed
    }

    pub fn is_killed(&self) -> bool {
        self.lock().killed
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn snapshot(&self) -> Vec<ProcessEntry> {
        self.lock().entries.clone()
    }
}

/// Removes its pid from the job when dropped.
#[derive(Debug)]
pub struct ProcessRegistration<'a> {
    processes: &'a JobProcesses,
    pid: u32,
}

impl Drop for ProcessRegistration<'_> {
    fn drop(&mut self) {
        self.processes.deregister(self.pid);
    }
}
