//! HTTP enumeration modules

use super::{shell_quote, JobContext, JobTarget, ReconModule, Scope, DEFAULT_TAG};
use crate::inventory::{Service, Transport};
use crate::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Ports where an unnamed service is worth an HTTP probe
pub const COMMON_WEB_PORTS: [u16; 5] = [80, 443, 8000, 8080, 8443];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Base URL for `name` on `service`; the port is omitted when it is the
/// scheme default.
pub fn service_url(service: &Service, name: &str) -> String {
    let (scheme, default_port) = if service.is_tls() {
        ("https", 443)
    } else {
        ("http", 80)
    };

    if service.port == default_port {
        format!("{}://{}", scheme, name)
    } else {
        format!("{}://{}:{}", scheme, name, service.port)
    }
}

/// Answers "does this port speak HTTP", once per URL.
#[derive(Debug, Default)]
pub struct HttpProbe {
    cache: Mutex<HashMap<String, bool>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn responds(&self, url: &str) -> bool {
        if let Some(answer) = self.cache.lock().await.get(url) {
            return *answer;
        }

        let answer = match Self::probe(url).await {
            Ok(status) => {
                debug!("{} answered {}", url, status);
                true
            }
            Err(e) => {
                info!("Service not responding to HTTP: {} ({})", url, e);
                false
            }
        };
        self.cache.lock().await.insert(url.to_string(), answer);
        answer
    }

    async fn probe(url: &str) -> std::result::Result<reqwest::StatusCode, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(client.get(url).send().await?.status())
    }

    /// Named `http`/`https`, or a likely web port that answers a request.
    pub async fn is_http(&self, service: &Service) -> bool {
        if service.transport != Transport::Tcp {
            return false;
        }
        if service.name == "http" || service.name == "https" {
            return true;
        }
        if service.fingerprint.contains("HTTP") || COMMON_WEB_PORTS.contains(&service.port) {
            return self.responds(&service_url(service, &service.host)).await;
        }
        false
    }
}

/// The wrapped HTTP tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpTool {
    WhatWeb,
    Dirsearch,
    Gau,
    Gospider,
    Hakrawler,
    Wafw00f,
    TestSsl,
}

impl HttpTool {
    pub fn all() -> Vec<HttpTool> {
        vec![
            HttpTool::WhatWeb,
            HttpTool::Dirsearch,
            HttpTool::Gau,
            HttpTool::Gospider,
            HttpTool::Hakrawler,
            HttpTool::Wafw00f,
            HttpTool::TestSsl,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            HttpTool::WhatWeb => "whatweb",
            HttpTool::Dirsearch => "dirsearch",
            HttpTool::Gau => "gau",
            HttpTool::Gospider => "gospider",
            HttpTool::Hakrawler => "hakrawler",
            HttpTool::Wafw00f => "wafw00f",
            HttpTool::TestSsl => "testssl",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            HttpTool::WhatWeb => "Fingerprint web technologies",
            HttpTool::Dirsearch => "Brute-force web paths",
            HttpTool::Gau => "Fetch known URLs from public archives",
            HttpTool::Gospider => "Crawl the site",
            HttpTool::Hakrawler => "Crawl the site for endpoints",
            HttpTool::Wafw00f => "Detect web application firewalls",
            HttpTool::TestSsl => "Audit the TLS configuration",
        }
    }
}

/// One HTTP tool run against every name of the host
pub struct HttpModule {
    tool: HttpTool,
    probe: Arc<HttpProbe>,
}

impl HttpModule {
    pub fn new(tool: HttpTool, probe: Arc<HttpProbe>) -> Self {
        Self { tool, probe }
    }

    /// Command line and output suffix for one URL
    fn command(&self, ctx: &JobContext, service: &Service, name: &str, url: &str) -> (String, Option<String>) {
        let url = shell_quote(url);
        match self.tool {
            HttpTool::WhatWeb => (
                format!(
                    "whatweb -v -a 1 --user-agent {} {}",
                    shell_quote(&ctx.config.user_agent),
                    url
                ),
                Some(format!("whatweb-{}.txt", name)),
            ),
            HttpTool::Dirsearch => {
                // dirsearch writes its own report
                let report = ctx.output_path(&format!("dirsearch-{}.txt", name));
                (
                    format!(
                        "dirsearch -b -q --random-agent -u {} -o {}",
                        url,
                        shell_quote(&report.to_string_lossy())
                    ),
                    None,
                )
            }
            HttpTool::Gau => (format!("echo {} | gau", url), Some(format!("gau-{}.txt", name))),
            HttpTool::Gospider => (format!("gospider -s {}", url), Some(format!("gospider-{}.txt", name))),
            HttpTool::Hakrawler => (
                format!("echo {} | hakrawler -s -u -insecure -d 3", url),
                Some(format!("hakrawler-{}.txt", name)),
            ),
            HttpTool::Wafw00f => (format!("wafw00f {}", url), Some(format!("wafw00f-{}.txt", name))),
            HttpTool::TestSsl => {
                let endpoint = format!("{}:{}", service.host, service.port);
                (format!("testssl {}", shell_quote(&endpoint)), Some("testssl.txt".to_string()))
            }
        }
    }
}

#[async_trait]
impl ReconModule for HttpModule {
    fn name(&self) -> &str {
        self.tool.name()
    }

    fn tags(&self) -> Vec<String> {
        vec!["http".to_string(), DEFAULT_TAG.to_string()]
    }

    fn scope(&self) -> Scope {
        Scope::Service
    }

    fn description(&self) -> &str {
        self.tool.description()
    }

    async fn applies_to(&self, target: &JobTarget) -> bool {
        let Some(service) = target.service() else {
            return false;
        };
        if self.tool == HttpTool::TestSsl && !service.is_tls() {
            return false;
        }
        self.probe.is_http(service).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let Some(service) = ctx.target.service() else {
            return Ok(());
        };

        // testssl checks the endpoint, not each virtual host
        let names = if self.tool == HttpTool::TestSsl {
            vec![ctx.target.host().address.clone()]
        } else {
            ctx.target.host().names()
        };

        for name in names {
            let url = service_url(service, &name);
            let (command, suffix) = self.command(ctx, service, &name, &url);
            ctx.run(&command, suffix.as_deref()).await?;
        }
        Ok(())
    }
}
