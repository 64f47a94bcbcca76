//! Script modules discovered on disk
//!
//! Any script in a module directory becomes a module named after its file
//! stem. Header comments carry the metadata:
//!
//! ```text
//! # @description: Grab SMB shares
//! # @tags: smb, default
//! # @scope: service
//! # @services: microsoft-ds, netbios-ssn
//! # @transport: tcp
//! # @ports: 139, 445
//! # @timeout: 600
//! # @call: {interpreter} {script} {address} {port} {prefix}
//! ```

use super::{shell_quote, JobContext, JobTarget, ReconModule, Scope, DEFAULT_TAG};
use crate::inventory::Transport;
use crate::{ReconError, Result};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File stems reserved for package initializers, never loaded as modules
pub const RESERVED_STEMS: [&str; 2] = ["__init__", "init"];

const SERVICE_CALL: &str = "{interpreter} {script} {address} {port} {prefix}";
const HOST_CALL: &str = "{interpreter} {script} {address} {prefix}";

/// Supported script languages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    Python,
    Shell,
    Ruby,
    Perl,
    Lua,
    /// Executed directly
    Binary,
}

impl ScriptLanguage {
    pub fn interpreter(&self) -> Option<&'static str> {
        match self {
            ScriptLanguage::Python => Some("python3"),
            ScriptLanguage::Shell => Some("sh"),
            ScriptLanguage::Ruby => Some("ruby"),
            ScriptLanguage::Perl => Some("perl"),
            ScriptLanguage::Lua => Some("lua"),
            ScriptLanguage::Binary => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "py" => Some(ScriptLanguage::Python),
            "sh" | "bash" => Some(ScriptLanguage::Shell),
            "rb" => Some(ScriptLanguage::Ruby),
            "pl" => Some(ScriptLanguage::Perl),
            "lua" => Some(ScriptLanguage::Lua),
            _ => None,
        }
    }
}

/// A module backed by an external script
#[derive(Debug, Clone)]
pub struct ScriptModule {
    pub path: PathBuf,
    pub name: String,
    pub language: ScriptLanguage,
    pub description: String,
    pub tags: Vec<String>,
    pub scope: Scope,
    /// Protocol names the script handles; empty means any
    pub services: Vec<String>,
    pub transport: Option<Transport>,
    pub ports: Option<Vec<u16>>,
    pub timeout: Option<Duration>,
    pub call_format: String,
}

impl ScriptModule {
    /// Build a module from a script path, reading its header metadata.
    ///
    /// Returns `Ok(None)` for files that are not loadable modules.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ReconError::ConfigError(format!("Invalid script filename: {}", path.display())))?;

        if stem.starts_with('.') || RESERVED_STEMS.contains(&stem) {
            return Ok(None);
        }

        let language = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => match ScriptLanguage::from_extension(ext) {
                Some(language) => language,
                None => return Ok(None),
            },
            None if is_executable(path) => ScriptLanguage::Binary,
            None => return Ok(None),
        };

        let mut module = Self {
            path: path.to_path_buf(),
            name: stem.to_lowercase(),
            language,
            description: String::new(),
            tags: Vec::new(),
            scope: Scope::Service,
            services: Vec::new(),
            transport: None,
            ports: None,
            timeout: None,
            call_format: String::new(),
        };

        // binaries carry no readable header
        if language != ScriptLanguage::Binary {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ReconError::ConfigError(format!("Failed to read script {}: {}", path.display(), e))
            })?;
            module.apply_metadata(&content);
        }

        if module.tags.is_empty() {
            module.tags.push(DEFAULT_TAG.to_string());
        }
        if module.call_format.is_empty() {
            module.call_format = match module.scope {
                Scope::Service => SERVICE_CALL,
                Scope::Host => HOST_CALL,
            }
            .to_string();
        }

        Ok(Some(module))
    }

    fn apply_metadata(&mut self, content: &str) {
        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        }

        for line in content.lines().take(50) {
            let line = line.trim();
            let comment = line
                .strip_prefix('#')
                .or_else(|| line.strip_prefix("//"))
                .or_else(|| line.strip_prefix("--"));
            let Some(comment) = comment else {
                continue;
            };
            let Some((key, value)) = comment.trim().strip_prefix('@').and_then(|c| c.split_once(':')) else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "description" => self.description = value.to_string(),
                "tags" => self.tags = list(value),
                "scope" => match value.to_lowercase().as_str() {
                    "host" => self.scope = Scope::Host,
                    "service" => self.scope = Scope::Service,
                    other => debug!("{}: unknown scope '{}'", self.name, other),
                },
                "services" => self.services = list(value),
                "transport" => self.transport = value.parse().ok(),
                "ports" => {
                    let ports: std::result::Result<Vec<u16>, _> =
                        value.split(',').map(|p| p.trim().parse::<u16>()).collect();
                    match ports {
                        Ok(ports) => self.ports = Some(ports),
                        Err(_) => debug!("{}: ignoring bad @ports '{}'", self.name, value),
                    }
                }
                "timeout" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        self.timeout = Some(Duration::from_secs(secs));
                    }
                }
                "call" => self.call_format = value.to_string(),
                _ => {}
            }
        }
    }

    /// Substitute the call format for one job.
    pub fn command(&self, ctx: &JobContext) -> String {
        let target = &ctx.target;
        let (port, transport, service) = match target.service() {
            Some(s) => (s.port.to_string(), s.transport.to_string(), s.name.clone()),
            None => (String::new(), String::new(), String::new()),
        };

        let command = self
            .call_format
            .replace("{interpreter}", self.language.interpreter().unwrap_or(""))
            .replace("{script}", &shell_quote(&self.path.to_string_lossy()))
            .replace("{address}", &shell_quote(&target.host().address))
            .replace("{port}", &port)
            .replace("{transport}", &transport)
            .replace("{service}", &shell_quote(&service))
            .replace("{prefix}", &shell_quote(&ctx.output_prefix().to_string_lossy()))
            .replace("{outdir}", &shell_quote(&ctx.output_dir.to_string_lossy()));

        command.trim().to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[async_trait]
impl ReconModule for ScriptModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> Vec<String> {
        self.tags.clone()
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn applies_to(&self, target: &JobTarget) -> bool {
        match (self.scope, target) {
            (Scope::Host, JobTarget::Host(_)) => true,
            (Scope::Service, JobTarget::Service { service, .. }) => {
                if self.transport.map(|t| t != service.transport).unwrap_or(false) {
                    return false;
                }
                let by_name = self.services.iter().any(|s| *s == service.name);
                let by_port = self.ports.as_ref().map(|p| p.contains(&service.port));
                match (self.services.is_empty(), by_port) {
                    (true, None) => true,
                    (true, Some(port_match)) => port_match,
                    (false, None) => by_name,
                    (false, Some(port_match)) => by_name || port_match,
                }
            }
            _ => false,
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let command = self.command(ctx);
        let timeout = self.timeout.or(ctx.timeout);
        ctx.run_with_timeout(&command, Some("output.txt"), timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_metadata_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "SMB_Enum.py",
            "#!/usr/bin/env python3\n# @tags: SMB, brute\n# @services: microsoft-ds\n# @ports: 445\n# @timeout: 30\nprint('x')\n",
        );
        let module = ScriptModule::from_path(&path).unwrap().unwrap();
        assert_eq!(module.name, "smb_enum");
        assert_eq!(module.tags, vec!["smb".to_string(), "brute".to_string()]);
        assert_eq!(module.services, vec!["microsoft-ds".to_string()]);
        assert_eq!(module.ports, Some(vec![445]));
        assert_eq!(module.timeout, Some(Duration::from_secs(30)));
        assert_eq!(module.scope, Scope::Service);
    }

    #[test]
    fn test_untagged_script_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "hello.sh", "echo hello\n");
        let module = ScriptModule::from_path(&path).unwrap().unwrap();
        assert_eq!(module.tags, vec![DEFAULT_TAG.to_string()]);
    }

    #[test]
    fn test_reserved_and_unknown_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let init = write_script(dir.path(), "__init__.py", "");
        let notes = write_script(dir.path(), "notes.md", "# @tags: x\n");
        assert!(ScriptModule::from_path(&init).unwrap().is_none());
        assert!(ScriptModule::from_path(&notes).unwrap().is_none());
    }
}
