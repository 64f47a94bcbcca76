//! whois lookups for a host and the domains of its hostnames

use super::{shell_quote, JobContext, JobTarget, ReconModule, Scope, DEFAULT_TAG};
use crate::inventory::Host;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;

pub struct Whois;

/// Last two labels of every hostname that is not an IP literal.
pub fn registrable_domains(host: &Host) -> BTreeSet<String> {
    host.hostnames
        .iter()
        .filter(|name| name.parse::<IpAddr>().is_err())
        .filter_map(|name| {
            let labels: Vec<&str> = name.trim_end_matches('.').split('.').collect();
            if labels.len() < 2 {
                return None;
            }
            Some(labels[labels.len() - 2..].join(".").to_lowercase())
        })
        .collect()
}

#[async_trait]
impl ReconModule for Whois {
    fn name(&self) -> &str {
        "whois"
    }

    fn tags(&self) -> Vec<String> {
        vec![DEFAULT_TAG.to_string()]
    }

    fn scope(&self) -> Scope {
        Scope::Host
    }

    fn description(&self) -> &str {
        "whois for the address and its domains"
    }

    async fn applies_to(&self, target: &JobTarget) -> bool {
        matches!(target, JobTarget::Host(_))
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let host = ctx.target.host();

        let queries = std::iter::once(host.address.clone()).chain(registrable_domains(host));
        for query in queries {
            ctx.run(
                &format!("whois {}", shell_quote(&query)),
                Some(&format!("whois-{}.txt", query)),
            )
            .await?;
        }
        Ok(())
    }
}
