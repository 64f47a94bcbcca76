use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use log::LevelFilter;
use std::path::PathBuf;
use std::process;

use blackbird::{
    config::{BruteType, ReconConfig},
    engine::{resolve_workdir, Orchestrator, RunOptions, RunOutcome},
    inventory::Service,
    logging,
    modules::registry::parse_selectors,
    modules::ModuleRegistry,
};

const LOG_FILE: &str = "blackbird.log";

fn print_banner() {
    println!("{}", " ____  _            _    _     _         _ ".bright_white().bold());
    println!("{}", "| __ )| | __ _  ___| | _| |__ (_)_ __ __| |".bright_white().bold());
    println!("{}", "|  _ \\| |/ _` |/ __| |/ / '_ \\| | '__/ _` |".bright_white().bold());
    println!("{}", "| |_) | | (_| | (__|   <| |_) | | | | (_| |".bright_white().bold());
    println!("{}", "|____/|_|\\__,_|\\___|_|\\_\\_.__/|_|_|  \\__,_|".bright_white().bold());
    println!();
    println!("{}", "Recon orchestration on top of your nmap scans".bright_blue());
    println!();
}

fn build_cli() -> Command {
    Command::new("blackbird")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run recon modules against the services found by nmap")
        .arg(
            Arg::new("input-files")
                .short('i')
                .long("input-files")
                .value_name("FILES")
                .help("Comma-separated nmap XML files or directories to import")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Working directory (default: a fresh directory under the temp dir)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("modules")
                .short('M')
                .long("modules")
                .value_name("SELECTORS")
                .help("Comma-separated module names or tags, or 'all'")
                .default_value("default"),
        )
        .arg(
            Arg::new("targets")
                .short('t')
                .long("targets")
                .value_name("TARGETS")
                .help("Comma-separated addresses or hostnames (default: every host)"),
        )
        .arg(
            Arg::new("host-file")
                .short('H')
                .long("host-file")
                .value_name("FILE")
                .help("Hostname file: 'ADDRESS name1,name2' per line")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("userlist")
                .short('U')
                .long("userlist")
                .value_name("FILE")
                .help("Username list for bruteforce modules")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("passlist")
                .short('P')
                .long("passlist")
                .value_name("FILE")
                .help("Password list for bruteforce modules")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("userpasslist")
                .short('C')
                .long("userpasslist")
                .value_name("FILE")
                .help("'user:password' list for bruteforce modules")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("brute-type")
                .long("brute-type")
                .value_name("TYPE")
                .help("Wordlists to use: bundled defaults plus custom lists, or custom only")
                .value_parser(["default", "custom"]),
        )
        .arg(
            Arg::new("search")
                .long("search")
                .value_name("KEYWORD")
                .help("List services matching a keyword and exit"),
        )
        .arg(
            Arg::new("list-modules")
                .long("list-modules")
                .help("List available modules and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Log commands without running them")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max-jobs")
                .long("max-jobs")
                .value_name("N")
                .help("Jobs running at once")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-commands")
                .long("max-commands")
                .value_name("N")
                .help("External commands running at once")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Per-command timeout, 0 disables it")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: ~/.blackbird.toml)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("module-dir")
                .long("module-dir")
                .value_name("DIR")
                .help("Extra directory to load script modules from")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("no-logo")
                .long("no-logo")
                .help("Do not print the banner")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug output")
                .action(ArgAction::SetTrue)
                .conflicts_with("quiet"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only warnings and errors")
                .action(ArgAction::SetTrue),
        )
}

/// CLI flags take precedence over the configuration file.
fn apply_overrides(config: &mut ReconConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(&max_jobs) = matches.get_one::<usize>("max-jobs") {
        config.max_jobs = max_jobs;
    }
    if let Some(&max_commands) = matches.get_one::<usize>("max-commands") {
        config.max_commands = max_commands;
    }
    if let Some(&timeout) = matches.get_one::<u64>("timeout") {
        config.cmd_timeout_secs = timeout;
    }
    if matches.get_flag("dry-run") {
        config.dry_run = true;
    }
    if matches.get_flag("no-logo") {
        config.show_logo = false;
    }
    if let Some(brute_type) = matches.get_one::<String>("brute-type") {
        config.brute_type = brute_type.parse::<BruteType>()?;
    }
    if let Some(list) = matches.get_one::<PathBuf>("userlist") {
        config.user_list = Some(list.clone());
    }
    if let Some(list) = matches.get_one::<PathBuf>("passlist") {
        config.pass_list = Some(list.clone());
    }
    if let Some(list) = matches.get_one::<PathBuf>("userpasslist") {
        config.userpass_list = Some(list.clone());
    }
    if let Some(dirs) = matches.get_many::<PathBuf>("module-dir") {
        let mut module_dirs: Vec<PathBuf> = dirs.cloned().collect();
        module_dirs.append(&mut config.module_dirs);
        config.module_dirs = module_dirs;
    }
    Ok(())
}

fn print_modules(registry: &ModuleRegistry) {
    println!("{}", "Available modules:".bright_cyan().bold());
    println!();
    for module in registry.modules() {
        println!(
            "  {:<20} {:<8} {}",
            module.name().bright_green(),
            module.scope().to_string(),
            module.tags().join(",").bright_yellow()
        );
        if !module.description().is_empty() {
            println!("  {:<20} {}", "", module.description().dimmed());
        }
    }
}

fn print_services(keyword: &str, services: &[Service]) {
    if services.is_empty() {
        println!("{}", format!("No service matches '{}'", keyword).yellow());
        return;
    }

    println!("{}", format!("Services matching '{}':", keyword).bright_cyan().bold());
    for service in services {
        println!(
            "  {:<24} {:<14} {}",
            service.to_string().bright_cyan(),
            service.name.bright_green(),
            service.banner()
        );
    }
}

async fn run() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else if matches.get_flag("quiet") {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };

    if matches.get_flag("list-modules") {
        logging::init(level, None)?;
        let mut config = ReconConfig::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
            .context("Failed to load configuration")?;
        apply_overrides(&mut config, &matches)?;
        let registry = ModuleRegistry::discover(&config)?;
        print_modules(&registry);
        return Ok(());
    }

    let workdir = resolve_workdir(matches.get_one::<PathBuf>("output-dir").map(PathBuf::as_path))
        .context("Cannot create working directory")?;
    logging::init(level, Some(&workdir.join(LOG_FILE)))?;

    let mut config = ReconConfig::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .context("Failed to load configuration")?;
    apply_overrides(&mut config, &matches)?;
    config.validate().context("Invalid configuration")?;

    if config.show_logo {
        print_banner();
    }

    let mut options = RunOptions::new(workdir.clone());
    options.input_files = matches
        .get_many::<PathBuf>("input-files")
        .map(|files| files.cloned().collect())
        .unwrap_or_default();
    options.modules = matches
        .get_one::<String>("modules")
        .map(|m| parse_selectors(m))
        .unwrap_or_default();
    options.targets = matches.get_one::<String>("targets").cloned();
    options.host_file = matches.get_one::<PathBuf>("host-file").cloned();
    options.search = matches.get_one::<String>("search").cloned();
    options.interactive = true;

    let orchestrator = Orchestrator::new(config)?;
    match orchestrator.run(&options).await? {
        RunOutcome::Search(services) => {
            print_services(options.search.as_deref().unwrap_or_default(), &services);
        }
        RunOutcome::Completed(summary) => {
            summary.print();
            println!();
            println!("{} {}", "Results are in".bright_white().bold(), workdir.display().to_string().bright_cyan());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "[E]".bright_red().bold(), e);
        process::exit(1);
    }
}
