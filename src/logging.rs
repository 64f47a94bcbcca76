//! Logger setup: `[I]`/`[W]`/`[E]`/`[D]` prefixed lines on stderr, mirrored
//! without color codes into the run's log file.

use crate::{ReconError, Result};
use colored::*;
use log::{Level, LevelFilter};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ANSI escape pattern"));

/// Strip terminal color sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Writes every record to stderr and, without colors, to a file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        let plain = strip_ansi(&String::from_utf8_lossy(buf));
        self.file.write_all(plain.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn level_tag(level: Level) -> ColoredString {
    match level {
        Level::Error => "[E]".bright_red().bold(),
        Level::Warn => "[W]".bright_yellow(),
        Level::Info => "[I]".bright_green(),
        Level::Debug => "[D]".bright_blue(),
        Level::Trace => "[T]".dimmed(),
    }
}

/// Install the global logger. `RUST_LOG` overrides `level`.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "{} {}", level_tag(record.level()), record.args()));

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder
        .try_init()
        .map_err(|e| ReconError::ConfigError(format!("Failed to initialise logger: {}", e)))
}
