//! Blackbird - recon orchestration on top of nmap scans
//!
//! Imports nmap XML into an inventory of hosts and services, then runs
//! recon modules against them under bounded, operator-controllable
//! concurrency.

pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod modules;
pub mod report;
pub mod runner;
pub mod scheduler;

// Re-export commonly used types
pub use config::ReconConfig;
pub use engine::{Orchestrator, RunOptions, RunOutcome};
pub use error::{ReconError, ReconResult};
pub use inventory::{Host, Inventory, Service, Transport};
pub use modules::{JobContext, JobTarget, ModuleRegistry, ReconModule, Scope};
pub use report::RunSummary;
pub use runner::CommandRunner;
pub use scheduler::{JobState, Scheduler, SchedulerReport};

pub type Result<T> = std::result::Result<T, ReconError>;
