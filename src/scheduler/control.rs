//! Operator control channel
//!
//! A dedicated thread reads stdin and forwards lines; the scheduler loop is
//! the only consumer and the only party that acts on them.

use log::debug;
use std::collections::BTreeSet;
use std::io::{BufRead, IsTerminal};
use tokio::sync::mpsc;

/// Line-oriented operator input
#[derive(Debug)]
pub struct OperatorChannel {
    rx: mpsc::UnboundedReceiver<String>,
}

impl OperatorChannel {
    /// A channel fed by the returned sender.
    pub fn pair() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Forward stdin lines. `None` when stdin is not a terminal.
    pub fn stdin() -> Option<Self> {
        if !std::io::stdin().is_terminal() {
            return None;
        }

        let (tx, channel) = Self::pair();
        let spawned = std::thread::Builder::new()
            .name("operator-input".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                debug!("Operator input closed");
            });

        match spawned {
            Ok(_) => Some(channel),
            Err(e) => {
                log::warn!("Interactive control disabled: {}", e);
                None
            }
        }
    }

    /// Next line, `None` once the input is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Which running jobs the operator asked to kill
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSelection {
    /// `-1`: every running job, and the queue is dropped
    All,
    Indices(BTreeSet<usize>),
}

/// Parse the menu answer. Any invalid entry rejects the whole answer.
pub fn parse_selection(input: Option<&str>, running: usize) -> Result<KillSelection, String> {
    let input = input.ok_or_else(|| "no input".to_string())?.trim();
    if input.is_empty() {
        return Err("empty selection".to_string());
    }

    let mut all = false;
    let mut indices = BTreeSet::new();
    for item in input.split(',').map(str::trim) {
        if item == "-1" {
            all = true;
            continue;
        }
        let index: usize = item
            .parse()
            .map_err(|_| format!("'{}' is not a job index", item))?;
        if index >= running {
            return Err(format!("no running job with index {}", index));
        }
        indices.insert(index);
    }

    if all {
        return Ok(KillSelection::All);
    }
    Ok(KillSelection::Indices(indices))
}
