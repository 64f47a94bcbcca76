//! Configuration module for the blackbird orchestrator

use crate::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which wordlists the bruteforce modules use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BruteType {
    /// Bundled wordlists, plus custom lists when given
    Default,
    /// Only the custom lists supplied by the operator
    Custom,
}

impl FromStr for BruteType {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(BruteType::Default),
            "custom" => Ok(BruteType::Custom),
            other => Err(ReconError::ConfigError(format!(
                "Unknown brute type '{}' (expected 'default' or 'custom')",
                other
            ))),
        }
    }
}

impl fmt::Display for BruteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BruteType::Default => write!(f, "default"),
            BruteType::Custom => write!(f, "custom"),
        }
    }
}

/// Main configuration structure for a reconnaissance run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Per-command timeout in seconds (0 disables the timeout)
    pub cmd_timeout_secs: u64,

    /// Ceiling on concurrently running external commands
    pub max_commands: usize,

    /// Ceiling on concurrently running jobs
    pub max_jobs: usize,

    /// Log command lines without spawning anything
    pub dry_run: bool,

    /// Shell used to interpret command lines
    pub shell: String,

    /// Captured output above this size is truncated
    pub max_output_bytes: usize,

    /// Scheduler tick when no job finishes and no operator input arrives
    pub poll_interval_ms: u64,

    /// Trailing character of an operator line that opens the job menu
    pub menu_trigger: char,

    /// Directories searched for script modules
    pub module_dirs: Vec<PathBuf>,

    /// Directory holding the bundled bruteforce wordlists
    pub wordlist_dir: PathBuf,

    pub brute_type: BruteType,
    pub user_list: Option<PathBuf>,
    pub pass_list: Option<PathBuf>,
    pub userpass_list: Option<PathBuf>,

    /// User agent passed to HTTP tools
    pub user_agent: String,

    pub show_logo: bool,
}

impl Default for ReconConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            cmd_timeout_secs: 15 * 60,
            max_commands: 10,
            max_jobs: 5,
            dry_run: false,
            shell: "/bin/sh".to_string(),
            max_output_bytes: 8 * 1024 * 1024,
            poll_interval_ms: 200,
            menu_trigger: 'b',
            module_dirs: vec![home_dir.join(".blackbird").join("modules")],
            wordlist_dir: PathBuf::from("/usr/share/blackbird/wordlists"),
            brute_type: BruteType::Default,
            user_list: None,
            pass_list: None,
            userpass_list: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:67.0) Gecko/20100101 Firefox/67.0"
                .to_string(),
            show_logo: true,
        }
    }
}

impl ReconConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_max_commands(mut self, max_commands: usize) -> Self {
        self.max_commands = max_commands;
        self
    }

    /// Set the per-command timeout in seconds
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.cmd_timeout_secs = secs;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_module_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.module_dirs = dirs;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Per-command timeout, `None` when disabled
    pub fn cmd_timeout(&self) -> Option<Duration> {
        if self.cmd_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cmd_timeout_secs))
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ReconError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ReconConfig = toml::from_str(&content)
            .map_err(|e| ReconError::ConfigError(format!("Failed to parse TOML: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from ~/.blackbird.toml, falling back to defaults
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_path = home_dir.join(".blackbird.toml");

        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => {
                    log::debug!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", config_path.display(), e),
            }
        }

        Self::default()
    }

    /// Explicit path wins; otherwise the per-user default file is tried
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::load_default_config()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_commands == 0 {
            return Err(ReconError::ConfigError(
                "Command concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_jobs == 0 {
            return Err(ReconError::ConfigError(
                "Job concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_jobs > self.max_commands {
            return Err(ReconError::ConfigError(format!(
                "Job concurrency ({}) cannot exceed command concurrency ({})",
                self.max_jobs, self.max_commands
            )));
        }

        if self.shell.trim().is_empty() {
            return Err(ReconError::ConfigError("Shell cannot be empty".to_string()));
        }

        if self.user_list.is_some() != self.pass_list.is_some() {
            return Err(ReconError::ConfigError(
                "User list and password list must be supplied together".to_string(),
            ));
        }

        for list in [&self.user_list, &self.pass_list, &self.userpass_list]
            .into_iter()
            .flatten()
        {
            if !list.is_file() {
                return Err(ReconError::ConfigError(format!(
                    "Wordlist not found: {}",
                    list.display()
                )));
            }
        }

        if self.brute_type == BruteType::Custom
            && self.user_list.is_none()
            && self.userpass_list.is_none()
        {
            log::warn!("Brute type is 'custom' but no custom wordlist was given, bruteforce modules will do nothing");
        }

        Ok(())
    }
}
