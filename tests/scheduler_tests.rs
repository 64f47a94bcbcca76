//! Scheduler: expansion, bounded execution, failures and operator control

#![cfg(unix)]

use async_trait::async_trait;
use blackbird::config::ReconConfig;
use blackbird::inventory::{Host, Service, Transport};
use blackbird::modules::{JobContext, JobTarget, ModuleRegistry, ReconModule, Scope, ScriptModule};
use blackbird::runner::CommandRunner;
use blackbird::scheduler::{JobState, OperatorChannel, Scheduler};
use blackbird::ReconError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Tracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct MockModule {
    name: &'static str,
    /// Service name for service scope, `None` for host scope
    service: Option<&'static str>,
    command: &'static str,
    tags: Vec<&'static str>,
    fail: bool,
    tracker: Arc<Tracker>,
}

impl MockModule {
    fn for_service(name: &'static str, service: &'static str, command: &'static str) -> Self {
        Self {
            name,
            service: Some(service),
            command,
            tags: vec!["default"],
            fail: false,
            tracker: Arc::new(Tracker::default()),
        }
    }

    fn for_host(name: &'static str, command: &'static str) -> Self {
        Self {
            name,
            service: None,
            command,
            tags: vec!["default"],
            fail: false,
            tracker: Arc::new(Tracker::default()),
        }
    }

    fn tagged(mut self, tag: &'static str) -> Self {
        self.tags.push(tag);
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn tracked(mut self, tracker: &Arc<Tracker>) -> Self {
        self.tracker = Arc::clone(tracker);
        self
    }
}

#[async_trait]
impl ReconModule for MockModule {
    fn name(&self) -> &str {
        self.name
    }

    fn tags(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.to_string()).collect()
    }

    fn scope(&self) -> Scope {
        if self.service.is_some() {
            Scope::Service
        } else {
            Scope::Host
        }
    }

    async fn applies_to(&self, target: &JobTarget) -> bool {
        match (self.service, target.service()) {
            (Some(name), Some(service)) => service.name == name,
            (None, None) => true,
            _ => false,
        }
    }

    async fn run(&self, ctx: &JobContext) -> blackbird::Result<()> {
        let now = self.tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.peak.fetch_max(now, Ordering::SeqCst);
        let result = ctx.run(self.command, Some("out.txt")).await;
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);

        result?;
        if self.fail {
            return Err(ReconError::ModuleError("boom".to_string()));
        }
        Ok(())
    }
}

fn table(modules: Vec<MockModule>) -> BTreeMap<String, Arc<dyn ReconModule>> {
    modules
        .into_iter()
        .map(|m| (m.name.to_string(), Arc::new(m) as Arc<dyn ReconModule>))
        .collect()
}

fn web_host() -> Host {
    let mut host = Host::new("10.0.0.5");
    host.upsert_service(Service::new("10.0.0.5", Transport::Tcp, 80, "http"));
    host.upsert_service(Service::new("10.0.0.5", Transport::Tcp, 22, "ssh"));
    host
}

fn scheduler(workdir: &Path, config: ReconConfig) -> Scheduler {
    let config = config.with_poll_interval(20);
    Scheduler::new(CommandRunner::from_config(&config), Arc::new(config), workdir).with_interrupts(false)
}

fn operator(lines: &'static [&'static str], delay: Duration) -> OperatorChannel {
    let (tx, channel) = OperatorChannel::pair();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for line in lines {
            let _ = tx.send(line.to_string());
        }
    });
    channel
}

#[tokio::test]
async fn test_example_scenario_runs_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(Tracker::default());
    let mut registry = ModuleRegistry::new();
    assert!(registry.register(Arc::new(
        MockModule::for_service("http_probe", "http", "echo http")
            .tagged("http")
            .tracked(&tracker),
    )));
    assert!(registry.register(Arc::new(
        MockModule::for_service("ssh_brute", "ssh", "echo ssh").tracked(&tracker),
    )));
    assert!(registry.register(Arc::new(MockModule::for_host("whois", "true"))));

    let modules = registry.resolve(&["http", "ssh_brute"]).unwrap();
    let names: Vec<&str> = modules.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["http_probe", "ssh_brute"]);

    let host = web_host();
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(1));

    let jobs = scheduler.expand(&modules, &[&host]).await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].module.name(), "http_probe");
    assert_eq!(jobs[0].target.to_string(), "10.0.0.5:80/tcp");
    assert_eq!(jobs[1].target.to_string(), "10.0.0.5:22/tcp");

    let report = scheduler.run(jobs, None).await;
    assert_eq!(report.count(JobState::Succeeded), 2);
    assert_eq!(report.peak_running, 1);
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);

    let output = dir.path().join("http_probe").join("10.0.0.5-tcp-80-out.txt");
    assert_eq!(std::fs::read_to_string(output).unwrap(), "http\n");
}

#[tokio::test]
async fn test_running_set_stays_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(Tracker::default());
    let modules = table(vec![MockModule::for_host("nap", "sleep 0.1").tracked(&tracker)]);
    let hosts: Vec<Host> = (1..=8).map(|i| Host::new(format!("10.0.1.{}", i))).collect();
    let hosts: Vec<&Host> = hosts.iter().collect();
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(3));

    let jobs = scheduler.expand(&modules, &hosts).await;
    let report = scheduler.run(jobs, None).await;

    assert_eq!(report.jobs.len(), 8);
    assert!(report.jobs.iter().all(|j| j.state.is_terminal()));
    assert_eq!(report.count(JobState::Succeeded), 8);
    assert!(report.peak_running <= 3);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_modules_skip_targets_they_do_not_apply_to() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![MockModule::for_service("smtp_enum", "smtp", "true")]);
    let host = web_host();
    let scheduler = scheduler(dir.path(), ReconConfig::default());

    let jobs = scheduler.expand(&modules, &[&host]).await;
    assert!(jobs.is_empty());
    let report = scheduler.run(jobs, None).await;
    assert!(report.jobs.is_empty());
}

#[tokio::test]
async fn test_failure_is_isolated_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![
        MockModule::for_host("a_broken", "true").failing(),
        MockModule::for_host("b_fine", "true"),
    ]);
    let host = Host::new("10.0.0.5");
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(2));

    let jobs = scheduler.expand(&modules, &[&host]).await;
    let report = scheduler.run(jobs, None).await;

    let broken = report.job(0).unwrap();
    assert_eq!(broken.state, JobState::Failed);
    assert!(broken.error.as_deref().unwrap().contains("boom"));
    assert_eq!(report.job(1).unwrap().state, JobState::Succeeded);

    let log = dir.path().join("a_broken").join("10.0.0.5-error.log");
    assert!(std::fs::read_to_string(log).unwrap().contains("boom"));
}

#[tokio::test]
async fn test_command_timeout_marks_job() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![MockModule::for_host("slow", "sleep 5")]);
    let host = Host::new("10.0.0.5");
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_timeout(1));

    let jobs = scheduler.expand(&modules, &[&host]).await;
    let report = scheduler.run(jobs, None).await;
    assert_eq!(report.job(0).unwrap().state, JobState::TimedOut);
}

#[tokio::test]
async fn test_operator_kills_selected_job() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![
        MockModule::for_host("a_slow", "sleep 5"),
        MockModule::for_host("b_fast", "true"),
    ]);
    let host = Host::new("10.0.0.5");
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(1));

    let jobs = scheduler.expand(&modules, &[&host]).await;
    let control = operator(&["b", "0"], Duration::from_millis(300));
    let report = scheduler.run(jobs, Some(control)).await;

    let slow = report.job(0).unwrap();
    assert_eq!(slow.state, JobState::Killed);
    assert_eq!(slow.suspensions, 1);
    assert_eq!(report.job(1).unwrap().state, JobState::Succeeded);
    assert_eq!(report.discarded, 0);
}

#[tokio::test]
async fn test_invalid_answer_kills_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![MockModule::for_host("nap", "sleep 0.6")]);
    let host = Host::new("10.0.0.5");
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(1));

    let jobs = scheduler.expand(&modules, &[&host]).await;
    let control = operator(&["b", "7,x"], Duration::from_millis(200));
    let report = scheduler.run(jobs, Some(control)).await;

    let job = report.job(0).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.suspensions, 1);
    assert_eq!(report.count(JobState::Killed), 0);
}

#[tokio::test]
async fn test_kill_all_discards_queue() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![MockModule::for_host("slow", "sleep 5")]);
    let hosts: Vec<Host> = (1..=3).map(|i| Host::new(format!("10.0.2.{}", i))).collect();
    let hosts: Vec<&Host> = hosts.iter().collect();
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(1));

    let jobs = scheduler.expand(&modules, &hosts).await;
    let control = operator(&["b", "-1"], Duration::from_millis(300));
    let report = scheduler.run(jobs, Some(control)).await;

    assert_eq!(report.count(JobState::Killed), 3);
    assert_eq!(report.discarded, 2);
    assert!(report.job(0).unwrap().started.is_some());
    assert!(report.job(2).unwrap().started.is_none());
}

#[tokio::test]
async fn test_kill_all_with_typo_kills_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let modules = table(vec![MockModule::for_host("nap", "sleep 0.6")]);
    let hosts: Vec<Host> = (1..=3).map(|i| Host::new(format!("10.0.3.{}", i))).collect();
    let hosts: Vec<&Host> = hosts.iter().collect();
    let scheduler = scheduler(dir.path(), ReconConfig::default().with_max_jobs(1));

    let jobs = scheduler.expand(&modules, &hosts).await;
    let control = operator(&["b", "-1,x"], Duration::from_millis(200));
    let report = scheduler.run(jobs, Some(control)).await;

    assert_eq!(report.count(JobState::Succeeded), 3);
    assert_eq!(report.count(JobState::Killed), 0);
    assert_eq!(report.discarded, 0);
    assert_eq!(report.job(0).unwrap().suspensions, 1);
}

#[tokio::test]
async fn test_script_module_writes_into_job_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();
    let path = scripts.path().join("banner_grab.sh");
    std::fs::write(&path, "# @scope: host\necho \"scanned $1\"\necho done > \"$2-marker.txt\"\n").unwrap();
    let script = ScriptModule::from_path(&path).unwrap().unwrap();

    let mut modules: BTreeMap<String, Arc<dyn ReconModule>> = BTreeMap::new();
    modules.insert(script.name.clone(), Arc::new(script));
    let host = Host::new("10.0.0.5");
    let scheduler = scheduler(dir.path(), ReconConfig::default());

    let jobs = scheduler.expand(&modules, &[&host]).await;
    let report = scheduler.run(jobs, None).await;
    assert_eq!(report.count(JobState::Succeeded), 1);

    let output_dir = dir.path().join("banner_grab");
    let output = std::fs::read_to_string(output_dir.join("10.0.0.5-output.txt")).unwrap();
    assert_eq!(output, "scanned 10.0.0.5\n");
    assert!(output_dir.join("10.0.0.5-marker.txt").is_file());
}
