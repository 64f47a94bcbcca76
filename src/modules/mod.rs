//! Recon modules: the unit of work the scheduler dispatches
//!
//! A module declares its tags and scope, decides whether it applies to a
//! target, and runs external tools through the job's [`JobContext`].

pub mod brute;
pub mod http;
pub mod registry;
pub mod script;
pub mod whois;

pub use registry::ModuleRegistry;
pub use script::ScriptModule;

use crate::config::ReconConfig;
use crate::inventory::{Host, Service};
use crate::runner::{CommandOutput, CommandRunner, JobProcesses};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tag every module without explicit tags belongs to
pub const DEFAULT_TAG: &str = "default";

/// Whether a module runs once per service or once per host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Service,
    Host,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Service => write!(f, "service"),
            Scope::Host => write!(f, "host"),
        }
    }
}

/// What a job runs against
#[derive(Debug, Clone)]
pub enum JobTarget {
    Service { host: Arc<Host>, service: Service },
    Host(Arc<Host>),
}

impl JobTarget {
    pub fn host(&self) -> &Host {
        match self {
            JobTarget::Service { host, .. } => host,
            JobTarget::Host(host) => host,
        }
    }

    pub fn service(&self) -> Option<&Service> {
        match self {
            JobTarget::Service { service, .. } => Some(service),
            JobTarget::Host(_) => None,
        }
    }

    /// `<host>-<transport>-<port>` or `<host>`
    pub fn file_stem(&self) -> String {
        match self {
            JobTarget::Service { host, service } => {
                format!("{}-{}-{}", host.address, service.transport, service.port)
            }
            JobTarget::Host(host) => host.address.clone(),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Service { service, .. } => write!(f, "{}", service),
            JobTarget::Host(host) => write!(f, "{}", host.address),
        }
    }
}

/// Everything a running module needs
pub struct JobContext {
    pub module: String,
    pub target: JobTarget,
    /// `<workdir>/<module>`
    pub output_dir: PathBuf,
    pub runner: CommandRunner,
    pub processes: Arc<JobProcesses>,
    pub timeout: Option<Duration>,
    pub config: Arc<ReconConfig>,
    timed_out: AtomicBool,
}

impl JobContext {
    pub fn new(
        module: &str,
        target: JobTarget,
        workdir: &Path,
        runner: CommandRunner,
        config: Arc<ReconConfig>,
    ) -> Self {
        Self {
            module: module.to_string(),
            target,
            output_dir: workdir.join(module),
            runner,
            processes: Arc::new(JobProcesses::new()),
            timeout: config.cmd_timeout(),
            config,
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn with_processes(mut self, processes: Arc<JobProcesses>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `<output_dir>/<file stem>`
    pub fn output_prefix(&self) -> PathBuf {
        self.output_dir.join(self.target.file_stem())
    }

    /// `<output_dir>/<file stem>-<suffix>`
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}", self.target.file_stem(), sanitize(suffix)))
    }

    /// Run one command for this job, writing its output to
    /// `output_path(suffix)` when a suffix is given.
    pub async fn run(&self, command: &str, suffix: Option<&str>) -> Result<CommandOutput> {
        self.run_with_timeout(command, suffix, self.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        command: &str,
        suffix: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let sink = suffix.map(|s| self.output_path(s));
        let output = self
            .runner
            .run_tracked(command, timeout, sink.as_deref(), Some(&self.processes))
            .await?;
        if output.timed_out() {
            self.timed_out.store(true, Ordering::SeqCst);
        }
        Ok(output)
    }

    /// Whether any command of this job hit its timeout
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// A unit of reconnaissance logic
#[async_trait]
pub trait ReconModule: Send + Sync {
    fn name(&self) -> &str;

    /// Lower-case tags; never empty
    fn tags(&self) -> Vec<String>;

    fn scope(&self) -> Scope;

    fn description(&self) -> &str {
        ""
    }

    /// Capability check, evaluated once per candidate target before any job
    /// is created.
    async fn applies_to(&self, target: &JobTarget) -> bool;

    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

/// Quote a value for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Keep file names flat.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect()
}

/// Built-in module table
pub fn builtin_modules() -> Vec<Arc<dyn ReconModule>> {
    let probe = Arc::new(http::HttpProbe::new());
    let mut modules: Vec<Arc<dyn ReconModule>> = http::HttpTool::all()
        .into_iter()
        .map(|kind| Arc::new(http::HttpModule::new(kind, Arc::clone(&probe))) as Arc<dyn ReconModule>)
        .collect();
    modules.push(Arc::new(brute::HydraBrute::ssh()));
    modules.push(Arc::new(whois::Whois));
    modules
}
