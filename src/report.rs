//! Run summary persistence and display

use crate::runner::RunnerStats;
use crate::scheduler::{JobRecord, JobState, SchedulerReport};
use crate::Result;
use chrono::{DateTime, Local};
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under the workdir holding one JSON file per run
pub const RUNS_DIR: &str = "runs";

/// Everything worth keeping about one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub workdir: PathBuf,
    pub dry_run: bool,
    pub modules: Vec<String>,
    pub targets: Vec<String>,
    pub jobs: Vec<JobRecord>,
    pub peak_running: usize,
    pub discarded: usize,
    pub interrupted: bool,
    pub commands: RunnerStats,
}

impl RunSummary {
    pub fn new(
        started: DateTime<Local>,
        workdir: &Path,
        dry_run: bool,
        modules: Vec<String>,
        targets: Vec<String>,
        report: SchedulerReport,
        commands: RunnerStats,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started,
            finished: Local::now(),
            workdir: workdir.to_path_buf(),
            dry_run,
            modules,
            targets,
            jobs: report.jobs,
            peak_running: report.peak_running,
            discarded: report.discarded,
            interrupted: report.interrupted,
            commands,
        }
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished - self.started).num_milliseconds() as f64 / 1000.0
    }

    /// Write `<workdir>/runs/<id>.json` and return its path.
    pub fn save(&self) -> Result<PathBuf> {
        let dir = self.workdir.join(RUNS_DIR);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.id));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every readable summary in `<workdir>/runs`, newest first.
    pub fn list<P: AsRef<Path>>(workdir: P) -> Result<Vec<Self>> {
        let dir = workdir.as_ref().join(RUNS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(summary) = Self::load(&path) {
                    entries.push(summary);
                }
            }
        }

        entries.sort_by(|a, b| b.started.cmp(&a.started));
        Ok(entries)
    }

    pub fn print(&self) {
        println!();
        println!("{}", "Run Summary:".bright_cyan().bold());
        println!("{} {}", "ID:".bright_white().bold(), self.id.bright_yellow());
        println!("{} {}", "Workdir:".bright_white().bold(), self.workdir.display());
        println!("{} {:.2}s", "Duration:".bright_white().bold(), self.duration_seconds());
        if self.dry_run {
            println!("{}", "Dry run: no command was executed".yellow());
        }
        if self.interrupted {
            println!("{}", "Interrupted by the operator".red());
        }
        println!();

        if self.jobs.is_empty() {
            println!("{}", "No job matched the selected modules and targets.".yellow());
        } else {
            println!(
                "{:<6} {:<16} {:<28} {:<10}",
                "JOB".bold(),
                "MODULE".bold(),
                "TARGET".bold(),
                "STATE".bold()
            );
            for job in &self.jobs {
                let state = format!("{:<10}", job.state.to_string());
                let state = match job.state {
                    JobState::Succeeded => state.bright_green(),
                    JobState::Failed => state.bright_red(),
                    JobState::TimedOut => state.bright_yellow(),
                    JobState::Killed => state.red(),
                    _ => state.normal(),
                };
                println!("{:<6} {:<16} {:<28} {}", job.id, job.module, job.target, state);
            }
        }

        println!();
        println!(
            "{} succeeded, {} failed, {} timed out, {} killed ({} never started)",
            self.count(JobState::Succeeded).to_string().bright_green(),
            self.count(JobState::Failed).to_string().bright_red(),
            self.count(JobState::TimedOut).to_string().bright_yellow(),
            self.count(JobState::Killed).to_string().red(),
            self.discarded
        );
        println!(
            "{} commands, {} non-zero exits, {} timeouts, at most {} concurrent",
            self.commands.total_commands,
            self.commands.nonzero_exits,
            self.commands.timeouts,
            self.commands.peak_in_flight
        );
    }
}
