//! End-to-end orchestration in dry-run mode

use blackbird::config::ReconConfig;
use blackbird::engine::{resolve_workdir, Orchestrator, RunOptions, RunOutcome};
use blackbird::inventory::nmap_xml::SUMMARY_FILE;
use blackbird::modules::ModuleRegistry;
use blackbird::report::{RunSummary, RUNS_DIR};
use blackbird::scheduler::JobState;
use blackbird::ReconError;
use std::fs;
use std::path::{Path, PathBuf};

const SCAN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -sV 10.0.0.5 10.0.0.6">
  <host>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <hostnames><hostname name="web.example.com" type="PTR"/></hostnames>
    <ports>
      <port protocol="tcp" portid="22"><state state="open"/><service name="ssh"/></port>
      <port protocol="tcp" portid="80"><state state="open"/><service name="http"/></port>
    </ports>
  </host>
  <host>
    <address addr="10.0.0.6" addrtype="ipv4"/>
    <ports>
      <port protocol="udp" portid="161"><state state="open"/><service name="snmp"/></port>
    </ports>
  </host>
</nmaprun>
"#;

fn orchestrator() -> Orchestrator {
    let config = ReconConfig::default().with_dry_run(true).with_poll_interval(20);
    Orchestrator::with_registry(config, ModuleRegistry::with_builtins()).with_interrupts(false)
}

fn options(workdir: &Path, input: Option<PathBuf>) -> RunOptions {
    let mut options = RunOptions::new(workdir);
    options.input_files = input.into_iter().collect();
    options.modules = vec!["whois".to_string()];
    options
}

fn scan_file(dir: &Path) -> PathBuf {
    let path = dir.join("scan.xml");
    fs::write(&path, SCAN).unwrap();
    path
}

#[tokio::test]
async fn test_dry_run_schedules_and_records_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    let workdir = resolve_workdir(Some(workdir.as_path())).unwrap();
    let orchestrator = orchestrator();

    let outcome = orchestrator
        .run(&options(&workdir, Some(scan_file(dir.path()))))
        .await
        .unwrap();
    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected a completed run");
    };

    assert!(workdir.join(SUMMARY_FILE).is_file());
    assert_eq!(summary.jobs.len(), 2);
    assert_eq!(summary.count(JobState::Succeeded), 2);
    assert_eq!(summary.targets, vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]);
    assert!(summary.commands.not_executed >= 2);
    assert_eq!(summary.commands.total_commands, 0);

    let saved = RunSummary::list(&workdir).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, summary.id);
    assert!(workdir.join(RUNS_DIR).join(format!("{}.json", summary.id)).is_file());
}

#[tokio::test]
async fn test_later_run_reuses_summary() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator();

    orchestrator
        .run(&options(dir.path(), Some(scan_file(dir.path()))))
        .await
        .unwrap();

    let mut again = options(dir.path(), None);
    again.targets = Some("web.example.com".to_string());
    let RunOutcome::Completed(summary) = orchestrator.run(&again).await.unwrap() else {
        panic!("expected a completed run");
    };
    assert_eq!(summary.targets, vec!["10.0.0.5".to_string()]);
    assert_eq!(summary.jobs.len(), 1);
}

#[tokio::test]
async fn test_search_lists_matching_services() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(dir.path(), Some(scan_file(dir.path())));
    options.search = Some("snmp".to_string());

    let RunOutcome::Search(services) = orchestrator().run(&options).await.unwrap() else {
        panic!("expected search results");
    };
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].to_string(), "10.0.0.6:161/udp");
    assert!(!dir.path().join(RUNS_DIR).exists());
}

#[tokio::test]
async fn test_missing_inventory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = orchestrator().run(&options(dir.path(), None)).await.unwrap_err();
    assert!(matches!(err, ReconError::NoInventory(_)));
}

#[tokio::test]
async fn test_unknown_target_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(dir.path(), Some(scan_file(dir.path())));
    options.targets = Some("10.9.9.9".to_string());

    let err = orchestrator().run(&options).await.unwrap_err();
    assert!(matches!(err, ReconError::InvalidTarget(_)));
}

#[tokio::test]
async fn test_directory_input_is_swept() {
    let dir = tempfile::tempdir().unwrap();
    let scans = dir.path().join("scans");
    fs::create_dir_all(scans.join("dmz")).unwrap();
    fs::write(scans.join("dmz").join("full.xml"), SCAN).unwrap();
    fs::write(scans.join("partial.xml"), "<nmaprun><host>").unwrap();
    let workdir = dir.path().join("work");
    fs::create_dir_all(&workdir).unwrap();

    let RunOutcome::Completed(summary) = orchestrator()
        .run(&options(&workdir, Some(scans)))
        .await
        .unwrap()
    else {
        panic!("expected a completed run");
    };
    assert!(workdir.join(SUMMARY_FILE).is_file());
    assert_eq!(summary.targets.len(), 2);
}

#[tokio::test]
async fn test_explicit_bad_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.xml");
    fs::write(&broken, "<nmaprun><host>").unwrap();

    let err = orchestrator()
        .run(&options(dir.path(), Some(broken)))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::ImportError { .. }));
}
