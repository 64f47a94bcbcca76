//! Module registry: discovery and selector resolution

use super::{builtin_modules, ReconModule, ScriptModule};
use crate::config::ReconConfig;
use crate::{ReconError, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Selector that matches every module
pub const ALL_SELECTOR: &str = "all";

/// Name-ordered table of every loaded module
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn ReconModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for module in builtin_modules() {
            registry.register(module);
        }
        registry
    }

    /// `Discover`: built-ins plus the scripts found in the configured
    /// module directories.
    pub fn discover(config: &ReconConfig) -> Result<Self> {
        let mut registry = Self::with_builtins();
        for script in discover_scripts(&config.module_dirs)? {
            let name = script.name.clone();
            if !registry.register(Arc::new(script)) {
                warn!("Script module '{}' shadows an existing module, skipped", name);
            }
        }

        info!("Loaded {} modules", registry.len());
        debug!("Available modules: {:?}", registry.names());
        Ok(registry)
    }

    /// Add a module. Returns false, leaving the registry unchanged, when
    /// the name is taken.
    pub fn register(&mut self, module: Arc<dyn ReconModule>) -> bool {
        let name = module.name().to_lowercase();
        if self.modules.contains_key(&name) {
            return false;
        }
        self.modules.insert(name, module);
        true
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ReconModule>> {
        self.modules.get(&name.to_lowercase())
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<dyn ReconModule>> {
        self.modules.values()
    }

    /// `Resolve`: names win over tags; `all` selects everything; anything
    /// else is a configuration error.
    pub fn resolve<S: AsRef<str>>(&self, selectors: &[S]) -> Result<BTreeMap<String, Arc<dyn ReconModule>>> {
        let mut selected = BTreeMap::new();

        for selector in selectors {
            let selector = selector.as_ref().trim().to_lowercase();
            if selector.is_empty() {
                continue;
            }

            if selector == ALL_SELECTOR {
                selected.extend(self.modules.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
                continue;
            }

            if let Some(module) = self.modules.get(&selector) {
                selected.insert(selector, Arc::clone(module));
                continue;
            }

            let tagged: Vec<_> = self
                .modules
                .iter()
                .filter(|(_, m)| m.tags().iter().any(|t| *t == selector))
                .collect();
            if tagged.is_empty() {
                return Err(ReconError::ModuleNotFound(selector));
            }
            selected.extend(tagged.into_iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        }

        if selected.is_empty() {
            return Err(ReconError::ConfigError("No module selected".to_string()));
        }

        Ok(selected)
    }
}

/// Split a `-M` value such as `http,ssh_brute`.
pub fn parse_selectors(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Load script modules. Directories are searched in order and files in
/// path order, so the first of two same-named scripts always wins.
pub fn discover_scripts(dirs: &[PathBuf]) -> Result<Vec<ScriptModule>> {
    let mut scripts: Vec<ScriptModule> = Vec::new();

    for dir in dirs {
        if !dir.exists() {
            debug!("Module directory does not exist: {}", dir.display());
            continue;
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| ReconError::ConfigError(format!("Failed to read module directory: {}", e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| ReconError::ConfigError(format!("Failed to read directory entry: {}", e)))?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match ScriptModule::from_path(&path) {
                Ok(Some(script)) if scripts.iter().any(|s| s.name == script.name) => {
                    warn!("Duplicate script module '{}' at {}, skipped", script.name, path.display());
                }
                Ok(Some(script)) => scripts.push(script),
                Ok(None) => debug!("Not a module: {}", path.display()),
                Err(e) => warn!("Failed to load module from {}: {}", path.display(), e),
            }
        }
    }

    Ok(scripts)
}
