//! Orchestration: workdir, inventory, selection, scheduling and summary

use crate::config::ReconConfig;
use crate::inventory::nmap_xml::{ScanSummary, SUMMARY_FILE};
use crate::inventory::{read_scan_documents, sweep_scan_files, ImportMode, Inventory, Service};
use crate::modules::ModuleRegistry;
use crate::report::RunSummary;
use crate::runner::CommandRunner;
use crate::scheduler::{OperatorChannel, Scheduler};
use crate::{ReconError, Result};
use chrono::Local;
use log::{debug, info};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One invocation's inputs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// nmap XML files to merge into the summary; directories are swept
    pub input_files: Vec<PathBuf>,
    pub workdir: PathBuf,
    /// Module names, tags or `all`
    pub modules: Vec<String>,
    /// Comma-separated addresses or hostnames; every host when `None`
    pub targets: Option<String>,
    pub host_file: Option<PathBuf>,
    /// Print matching services instead of running modules
    pub search: Option<String>,
    /// Read operator commands from stdin
    pub interactive: bool,
}

impl RunOptions {
    pub fn new<P: Into<PathBuf>>(workdir: P) -> Self {
        Self {
            input_files: Vec::new(),
            workdir: workdir.into(),
            modules: vec![crate::modules::DEFAULT_TAG.to_string()],
            targets: None,
            host_file: None,
            search: None,
            interactive: false,
        }
    }
}

/// What a run produced
#[derive(Debug)]
pub enum RunOutcome {
    Search(Vec<Service>),
    Completed(RunSummary),
}

/// The given directory, or a fresh `blackbird-<timestamp>` one under the
/// temp dir. Created when absent.
pub fn resolve_workdir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::temp_dir().join(format!(
            "blackbird-{}",
            Local::now().format("%Y%m%d-%H%M%S-%3f")
        )),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub struct Orchestrator {
    config: Arc<ReconConfig>,
    registry: ModuleRegistry,
    runner: CommandRunner,
    interrupts: bool,
}

impl Orchestrator {
    /// Discover modules from the configured directories.
    pub fn new(config: ReconConfig) -> Result<Self> {
        let registry = ModuleRegistry::discover(&config)?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ReconConfig, registry: ModuleRegistry) -> Self {
        Self {
            runner: CommandRunner::from_config(&config),
            config: Arc::new(config),
            registry,
            interrupts: true,
        }
    }

    /// Whether Ctrl-C is handled by the scheduler
    pub fn with_interrupts(mut self, enabled: bool) -> Self {
        self.interrupts = enabled;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// Fold input files into the workdir summary, then load the summary and
    /// the hostname file.
    pub fn load_inventory(&self, options: &RunOptions) -> Result<Inventory> {
        let summary = ScanSummary::new(&options.workdir);

        // files are explicit imports, directories are sweeps
        let (sweeps, files): (Vec<&PathBuf>, Vec<&PathBuf>) =
            options.input_files.iter().partition(|p| p.is_dir());

        let mut documents = read_scan_documents(&files, ImportMode::Strict)?;
        for dir in sweeps {
            let found = sweep_scan_files(dir)?;
            let swept = read_scan_documents(&found, ImportMode::BestEffort)?;
            info!(
                "Swept {}: {} of {} scan files usable",
                dir.display(),
                swept.len(),
                found.len()
            );
            documents.extend(swept);
        }

        if !documents.is_empty() {
            summary.update(&documents)?;
            info!(
                "Imported {} scan files into {}",
                documents.len(),
                summary.path().display()
            );
        }

        if !summary.exists() {
            return Err(ReconError::NoInventory(format!(
                "no scan files given and no {} in {}",
                SUMMARY_FILE,
                options.workdir.display()
            )));
        }

        let mut inventory = Inventory::new();
        inventory.import_scan(&[summary.path()], ImportMode::Strict)?;
        if inventory.is_empty() {
            return Err(ReconError::NoInventory(format!(
                "{} holds no hosts",
                summary.path().display()
            )));
        }

        if let Some(host_file) = &options.host_file {
            inventory.merge_hostnames(host_file)?;
        }

        info!(
            "Inventory: {} hosts, {} services",
            inventory.len(),
            inventory.service_count()
        );
        Ok(inventory)
    }

    pub async fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        let started = Local::now();
        let inventory = self.load_inventory(options)?;
        let hosts = inventory.resolve(options.targets.as_deref())?;
        let modules = self.registry.resolve(&options.modules)?;
        debug!("Selected modules: {:?}", modules.keys().collect::<Vec<_>>());

        if let Some(keyword) = &options.search {
            let addresses: BTreeSet<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
            let found = inventory
                .find(keyword)
                .into_iter()
                .filter(|s| addresses.contains(s.host.as_str()))
                .cloned()
                .collect();
            return Ok(RunOutcome::Search(found));
        }

        let scheduler = Scheduler::new(
            self.runner.clone(),
            Arc::clone(&self.config),
            options.workdir.clone(),
        )
        .with_interrupts(self.interrupts);

        let jobs = scheduler.expand(&modules, &hosts).await;
        let control = if options.interactive {
            OperatorChannel::stdin()
        } else {
            None
        };
        let report = scheduler.run(jobs, control).await;

        let summary = RunSummary::new(
            started,
            &options.workdir,
            self.config.dry_run,
            modules.keys().cloned().collect(),
            hosts.iter().map(|h| h.address.clone()).collect(),
            report,
            self.runner.stats().await,
        );
        let path = summary.save()?;
        info!("Run summary written to {}", path.display());
        info!("Output is in {}", options.workdir.display());

        Ok(RunOutcome::Completed(summary))
    }
}
