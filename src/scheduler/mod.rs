//! Job Scheduler - bounded, interruptible execution of module jobs
//!
//! Jobs are expanded from (module × target) pairs, admitted FIFO into a
//! bounded running set and reaped as they finish. The loop is the only
//! writer of the queue and the running set; operator input arrives as lines
//! on an [`OperatorChannel`] and is acted on between iterations.

pub mod control;

pub use control::{parse_selection, KillSelection, OperatorChannel};

use crate::config::ReconConfig;
use crate::inventory::Host;
use crate::modules::{JobContext, JobTarget, ReconModule, Scope};
use crate::runner::{CommandRunner, JobProcesses};
use crate::ReconError;
use chrono::{DateTime, Local};
use colored::*;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Suspended,
    Succeeded,
    Failed,
    TimedOut,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Killed
        )
    }

    fn colored(&self) -> ColoredString {
        let label = self.to_string();
        match self {
            JobState::Succeeded => label.bright_green(),
            JobState::Failed => label.bright_red(),
            JobState::TimedOut => label.bright_yellow(),
            JobState::Killed => label.red(),
            _ => label.bright_blue(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Suspended => "suspended",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed-out",
            JobState::Killed => "killed",
        };
        write!(f, "{}", label)
    }
}

/// Module result and whether any of its commands timed out
type JobHandle = JoinHandle<(crate::Result<()>, bool)>;

/// One module bound to one target
pub struct Job {
    pub id: usize,
    pub module: Arc<dyn ReconModule>,
    pub target: JobTarget,
    /// `<workdir>/<module>/<file stem>`
    pub output_prefix: PathBuf,
    pub processes: Arc<JobProcesses>,
    pub timeout: Option<Duration>,
    state: JobState,
    created: DateTime<Local>,
    started: Option<DateTime<Local>>,
    finished: Option<DateTime<Local>>,
    suspensions: usize,
    error: Option<String>,
    handle: Option<JobHandle>,
}

impl Job {
    pub fn new(
        id: usize,
        module: Arc<dyn ReconModule>,
        target: JobTarget,
        workdir: &Path,
        timeout: Option<Duration>,
    ) -> Self {
        let output_prefix = workdir.join(module.name()).join(target.file_stem());
        Self {
            id,
            module,
            target,
            output_prefix,
            processes: Arc::new(JobProcesses::new()),
            timeout,
            state: JobState::Queued,
            created: Local::now(),
            started: None,
            finished: None,
            suspensions: 0,
            error: None,
            handle: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn suspensions(&self) -> usize {
        self.suspensions
    }

    fn start(&mut self, runner: CommandRunner, config: Arc<ReconConfig>, workdir: &Path, notify: Arc<Notify>) {
        let ctx = JobContext::new(self.module.name(), self.target.clone(), workdir, runner, config)
            .with_processes(Arc::clone(&self.processes))
            .with_timeout(self.timeout);
        let module = Arc::clone(&self.module);

        debug!("Starting job {}: {} on {}", self.id, module.name(), self.target);
        self.handle = Some(tokio::spawn(async move {
            let result = match tokio::fs::create_dir_all(&ctx.output_dir).await {
                Ok(()) => module.run(&ctx).await,
                Err(e) => Err(ReconError::from(e)),
            };
            notify.notify_one();
            (result, ctx.timed_out())
        }));

        self.state = JobState::Running;
        self.started = Some(Local::now());
    }

    fn task_finished(&self) -> bool {
        self.handle.as_ref().map(JoinHandle::is_finished).unwrap_or(false)
    }

    /// Stop the job's process tree. Only a running job can be suspended.
    pub fn suspend(&mut self) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.processes.suspend();
        self.state = JobState::Suspended;
        self.suspensions += 1;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != JobState::Suspended {
            return false;
        }
        self.processes.resume();
        self.state = JobState::Running;
        true
    }

    /// Kill the process tree and cancel the task. A no-op for jobs that have
    /// already ended.
    pub fn kill(&mut self) -> bool {
        if self.state.is_terminal() || self.task_finished() {
            return false;
        }
        self.processes.kill();
        if let Some(handle) = &self.handle {
            handle.abort();
        } else {
            self.finished = Some(Local::now());
        }
        self.state = JobState::Killed;
        true
    }

    /// Collect the task result and settle the terminal state.
    async fn reap(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let outcome = handle.await;
        self.finished = Some(Local::now());

        if self.state == JobState::Killed {
            return;
        }

        self.state = match outcome {
            Ok((Ok(()), false)) => JobState::Succeeded,
            Ok((Ok(()), true)) => JobState::TimedOut,
            Ok((Err(ReconError::Killed), _)) => JobState::Killed,
            Ok((Err(e), _)) => {
                self.error = Some(e.to_string());
                JobState::Failed
            }
            Err(e) if e.is_cancelled() => JobState::Killed,
            Err(e) => {
                self.error = Some(format!("job panicked: {}", e));
                JobState::Failed
            }
        };

        if self.state == JobState::Failed {
            self.write_error_log().await;
        }
    }

    async fn write_error_log(&self) {
        let path = PathBuf::from(format!("{}-error.log", self.output_prefix.display()));
        let text = format!(
            "module: {}\ntarget: {}\nerror: {}\n",
            self.module.name(),
            self.target,
            self.error.as_deref().unwrap_or("unknown")
        );
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&path, text).await {
            warn!("Could not write {}: {}", path.display(), e);
        }
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            module: self.module.name().to_string(),
            target: self.target.to_string(),
            output_prefix: self.output_prefix.clone(),
            state: self.state,
            created: self.created,
            started: self.started,
            finished: self.finished,
            suspensions: self.suspensions,
            error: self.error.clone(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} on {}", self.id, self.module.name(), self.target)
    }
}

/// Serializable view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: usize,
    pub module: String,
    pub target: String,
    pub output_prefix: PathBuf,
    pub state: JobState,
    pub created: DateTime<Local>,
    pub started: Option<DateTime<Local>>,
    pub finished: Option<DateTime<Local>>,
    pub suspensions: usize,
    pub error: Option<String>,
}

/// Outcome of a scheduling run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerReport {
    /// Every job, by id
    pub jobs: Vec<JobRecord>,
    /// Largest running set observed
    pub peak_running: usize,
    /// Queued jobs dropped by the operator or an interrupt
    pub discarded: usize,
    pub interrupted: bool,
}

impl SchedulerReport {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn counts(&self) -> BTreeMap<JobState, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.jobs {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn job(&self, id: usize) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Build every applicable job. Modules are visited by name, hosts by
/// address and services by `(transport, port)`; targets the module does not
/// apply to never become jobs.
pub async fn expand_jobs(
    modules: &BTreeMap<String, Arc<dyn ReconModule>>,
    hosts: &[&Host],
    workdir: &Path,
    timeout: Option<Duration>,
) -> Vec<Job> {
    let hosts: Vec<Arc<Host>> = hosts.iter().map(|h| Arc::new((*h).clone())).collect();
    let mut jobs = Vec::new();

    for module in modules.values() {
        for host in &hosts {
            let targets: Vec<JobTarget> = match module.scope() {
                Scope::Host => vec![JobTarget::Host(Arc::clone(host))],
                Scope::Service => host
                    .services()
                    .map(|service| JobTarget::Service {
                        host: Arc::clone(host),
                        service: service.clone(),
                    })
                    .collect(),
            };

            for target in targets {
                if module.applies_to(&target).await {
                    jobs.push(Job::new(jobs.len(), Arc::clone(module), target, workdir, timeout));
                } else {
                    debug!("{} does not apply to {}", module.name(), target);
                }
            }
        }
    }

    info!("Expanded {} jobs", jobs.len());
    jobs
}

async fn next_line(control: &mut Option<OperatorChannel>) -> Option<String> {
    match control {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

/// Drives jobs to completion under a concurrency bound
pub struct Scheduler {
    runner: CommandRunner,
    config: Arc<ReconConfig>,
    workdir: PathBuf,
    max_jobs: usize,
    poll_interval: Duration,
    trigger: char,
    handle_interrupts: bool,
}

impl Scheduler {
    pub fn new<P: Into<PathBuf>>(runner: CommandRunner, config: Arc<ReconConfig>, workdir: P) -> Self {
        Self {
            max_jobs: config.max_jobs.max(1),
            poll_interval: config.poll_interval(),
            trigger: config.menu_trigger,
            runner,
            config,
            workdir: workdir.into(),
            handle_interrupts: true,
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    /// Whether Ctrl-C kills running jobs and ends the run
    pub fn with_interrupts(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub async fn expand(&self, modules: &BTreeMap<String, Arc<dyn ReconModule>>, hosts: &[&Host]) -> Vec<Job> {
        expand_jobs(modules, hosts, &self.workdir, self.config.cmd_timeout()).await
    }

    /// Run `jobs` until every one has ended.
    pub async fn run(&self, jobs: Vec<Job>, mut control: Option<OperatorChannel>) -> SchedulerReport {
        let mut queued: VecDeque<Job> = jobs.into();
        let mut running: Vec<Job> = Vec::new();
        let mut finished: Vec<Job> = Vec::new();
        let mut report = SchedulerReport::default();
        let notify = Arc::new(Notify::new());
        let mut last_status = (usize::MAX, usize::MAX);

        if control.is_some() {
            info!("Type '{}' and Enter to suspend jobs and open the kill menu", self.trigger);
        }

        loop {
            // reap
            let (done, alive): (Vec<Job>, Vec<Job>) =
                running.drain(..).partition(|job| job.task_finished());
            running = alive;
            for mut job in done {
                job.reap().await;
                self.log_finished(&job);
                finished.push(job);
            }

            // admit
            while running.len() < self.max_jobs {
                let Some(mut job) = queued.pop_front() else {
                    break;
                };
                job.start(
                    self.runner.clone(),
                    Arc::clone(&self.config),
                    &self.workdir,
                    Arc::clone(&notify),
                );
                running.push(job);
            }
            report.peak_running = report.peak_running.max(running.len());

            if queued.is_empty() && running.is_empty() {
                break;
            }

            if last_status != (queued.len(), running.len()) {
                last_status = (queued.len(), running.len());
                info!("Queued jobs: {} Currently running: {}", queued.len(), running.len());
            }

            tokio::select! {
                biased;

                line = next_line(&mut control) => {
                    match line {
                        Some(line) if line.trim_end().ends_with(self.trigger) => {
                            if let Some(channel) = control.as_mut() {
                                report.discarded += self
                                    .operator_menu(&mut running, &mut queued, &mut finished, channel)
                                    .await;
                            }
                        }
                        Some(line) => debug!("Ignoring operator input '{}'", line),
                        None => {
                            debug!("Operator channel closed");
                            control = None;
                        }
                    }
                }
                interrupt = tokio::signal::ctrl_c(), if self.handle_interrupts => {
                    if let Err(e) = interrupt {
                        warn!("Cannot listen for Ctrl-C: {}", e);
                    }
                    warn!("Interrupted, killing running jobs");
                    report.interrupted = true;
                    report.discarded += self
                        .kill_jobs(&mut running, &mut queued, &mut finished, None)
                        .await;
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("All jobs finished");
        finished.sort_by_key(|job| job.id);
        report.jobs = finished.iter().map(Job::record).collect();
        report
    }

    fn log_finished(&self, job: &Job) {
        match job.state() {
            JobState::Succeeded => info!("Job {} {}", job, job.state().colored()),
            JobState::Killed => warn!("Job {} {}", job, job.state().colored()),
            _ => warn!(
                "Job {} {}{}",
                job,
                job.state().colored(),
                job.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
            ),
        }
    }

    /// Kill the selected running jobs, or all of them and the queue when
    /// `selection` is `None`. Returns how many queued jobs were dropped.
    async fn kill_jobs(
        &self,
        running: &mut Vec<Job>,
        queued: &mut VecDeque<Job>,
        finished: &mut Vec<Job>,
        selection: Option<&[usize]>,
    ) -> usize {
        let mut discarded = 0;

        match selection {
            Some(indices) => {
                for &index in indices {
                    if let Some(job) = running.get_mut(index) {
                        warn!("Killing job {}", job);
                        job.kill();
                    }
                }
            }
            None => {
                for job in running.iter_mut() {
                    job.kill();
                }
                for mut job in queued.drain(..) {
                    job.kill();
                    discarded += 1;
                    finished.push(job);
                }
            }
        }

        let (killed, alive): (Vec<Job>, Vec<Job>) = running
            .drain(..)
            .partition(|job| job.state() == JobState::Killed);
        *running = alive;
        for mut job in killed {
            job.reap().await;
            self.log_finished(&job);
            finished.push(job);
        }

        discarded
    }

    /// Suspend everything, ask which jobs to kill, then resume the rest.
    async fn operator_menu(
        &self,
        running: &mut Vec<Job>,
        queued: &mut VecDeque<Job>,
        finished: &mut Vec<Job>,
        channel: &mut OperatorChannel,
    ) -> usize {
        info!("Invoking interactive menu...");
        for job in running.iter_mut() {
            job.suspend();
        }

        let rule = "*".repeat(80);
        println!("{}", rule.green());
        println!("Running jobs:");
        for (index, job) in running.iter().enumerate() {
            println!("\n{} - {}", index.to_string().green(), job.to_string().bright_cyan());
            for process in job.processes.snapshot() {
                println!(
                    "      pid {} since {} : {}",
                    process.pid.to_string().bright_yellow(),
                    process.started.format("%H:%M:%S"),
                    process.command
                );
            }
        }
        if !queued.is_empty() {
            println!("\n{} queued jobs not started", queued.len());
        }
        println!("{}", rule.green());
        print!("Choose jobs to kill (comma separated) (-1 to kill all): ");
        let _ = std::io::stdout().flush();

        let answer = channel.recv().await;
        let discarded = match parse_selection(answer.as_deref(), running.len()) {
            Ok(KillSelection::All) => {
                warn!("Killing all remaining jobs");
                self.kill_jobs(running, queued, finished, None).await
            }
            Ok(KillSelection::Indices(indices)) => {
                let indices: Vec<usize> = indices.into_iter().collect();
                self.kill_jobs(running, queued, finished, Some(indices.as_slice())).await
            }
            Err(reason) => {
                error!("Invalid choice ({}), no job killed", reason);
                0
            }
        };

        info!("Resuming jobs...");
        for job in running.iter_mut() {
            job.resume();
        }
        discarded
    }
}
