//! Credential bruteforce through hydra

use super::{shell_quote, JobContext, JobTarget, ReconModule, Scope};
use crate::config::BruteType;
use crate::inventory::Transport;
use crate::{ReconError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Credentials for one hydra pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wordlists {
    UserPass { users: PathBuf, passwords: PathBuf },
    Combined(PathBuf),
}

/// One hydra invocation and the file it reports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrutePass {
    pub wordlists: Wordlists,
    pub suffix: String,
}

/// Hydra against one service protocol, e.g. `ssh`
#[derive(Debug, Clone)]
pub struct HydraBrute {
    name: String,
    service: String,
}

impl HydraBrute {
    pub fn new(name: &str, service: &str) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
        }
    }

    pub fn ssh() -> Self {
        Self::new("ssh_brute", "ssh")
    }

    fn bundled(&self, wordlist_dir: &Path, kind: &str) -> Option<PathBuf> {
        let path = wordlist_dir.join(format!("{}-{}.txt", self.service, kind));
        if path.is_file() {
            Some(path)
        } else {
            warn!("Bundled wordlist missing: {}", path.display());
            None
        }
    }

    /// Passes to run: bundled lists unless only custom lists are wanted,
    /// then the operator's lists.
    pub fn passes(&self, ctx: &JobContext) -> Vec<BrutePass> {
        let config = &ctx.config;
        let mut passes = Vec::new();

        if config.brute_type != BruteType::Custom {
            let users = self.bundled(&config.wordlist_dir, "usernames");
            let passwords = self.bundled(&config.wordlist_dir, "passwords");
            if let (Some(users), Some(passwords)) = (users, passwords) {
                passes.push(BrutePass {
                    wordlists: Wordlists::UserPass { users, passwords },
                    suffix: "hydra-default-user-pass.txt".to_string(),
                });
            }
            if let Some(combined) = self.bundled(&config.wordlist_dir, "userpass") {
                passes.push(BrutePass {
                    wordlists: Wordlists::Combined(combined),
                    suffix: "hydra-default-userpass.txt".to_string(),
                });
            }
        }

        if let (Some(users), Some(passwords)) = (&config.user_list, &config.pass_list) {
            passes.push(BrutePass {
                wordlists: Wordlists::UserPass {
                    users: users.clone(),
                    passwords: passwords.clone(),
                },
                suffix: "hydra-custom-user-pass.txt".to_string(),
            });
        }
        if let Some(combined) = &config.userpass_list {
            passes.push(BrutePass {
                wordlists: Wordlists::Combined(combined.clone()),
                suffix: "hydra-custom-userpass.txt".to_string(),
            });
        }

        passes
    }

    pub fn command(&self, address: &str, port: u16, wordlists: &Wordlists) -> String {
        let target = format!("{}://{}:{}", self.service, address, port);
        match wordlists {
            Wordlists::UserPass { users, passwords } => format!(
                "hydra -t 4 -v -L {} -P {} -I -e nsr -f {}",
                shell_quote(&users.to_string_lossy()),
                shell_quote(&passwords.to_string_lossy()),
                shell_quote(&target)
            ),
            Wordlists::Combined(list) => format!(
                "hydra -t 4 -v -C {} -I -f {}",
                shell_quote(&list.to_string_lossy()),
                shell_quote(&target)
            ),
        }
    }
}

#[async_trait]
impl ReconModule for HydraBrute {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> Vec<String> {
        vec!["brute".to_string()]
    }

    fn scope(&self) -> Scope {
        Scope::Service
    }

    fn description(&self) -> &str {
        "Bruteforce credentials with hydra"
    }

    async fn applies_to(&self, target: &JobTarget) -> bool {
        target
            .service()
            .map(|s| s.transport == Transport::Tcp && s.name == self.service)
            .unwrap_or(false)
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let Some(service) = ctx.target.service() else {
            return Ok(());
        };

        let passes = self.passes(ctx);
        if passes.is_empty() {
            warn!("{}: no wordlists available for {}", self.name, ctx.target);
            return Ok(());
        }

        info!("Starting {} bruteforce against {}", self.service, ctx.target);

        let runs = passes.iter().map(|pass| {
            let command = self.command(&ctx.target.host().address, service.port, &pass.wordlists);
            async move { ctx.run(&command, Some(&pass.suffix)).await }
        });

        let mut first_error: Option<ReconError> = None;
        for result in join_all(runs).await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
