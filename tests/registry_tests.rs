//! Module discovery and selector resolution

use blackbird::config::ReconConfig;
use blackbird::modules::registry::discover_scripts;
use blackbird::modules::{ModuleRegistry, Scope};
use blackbird::ReconError;
use std::fs;
use std::path::Path;

fn script(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).expect("write script");
}

fn registry_with_scripts(dir: &Path) -> ModuleRegistry {
    let config = ReconConfig::default().with_module_dirs(vec![dir.to_path_buf()]);
    ModuleRegistry::discover(&config).unwrap()
}

#[test]
fn test_discover_loads_scripts_next_to_builtins() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "smb_shares.py", "# @tags: smb\n# @services: microsoft-ds\nprint('x')\n");
    script(dir.path(), "ping_host.sh", "# @scope: host\n# @tags: default, icmp\nping -c1 \"$1\"\n");
    script(dir.path(), "__init__.py", "");
    script(dir.path(), "README.md", "# @tags: docs\n");

    let registry = registry_with_scripts(dir.path());
    let builtins = ModuleRegistry::with_builtins().len();
    assert_eq!(registry.len(), builtins + 2);

    let ping = registry.get("ping_host").unwrap();
    assert_eq!(ping.scope(), Scope::Host);
    assert!(registry.get("__init__").is_none());
    assert!(registry.get("readme").is_none());
}

#[test]
fn test_builtin_wins_name_clash() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "whois.sh", "# @tags: custom\nwhois \"$1\"\n");

    let registry = registry_with_scripts(dir.path());
    let whois = registry.get("whois").unwrap();
    assert!(!whois.tags().contains(&"custom".to_string()));
}

#[test]
fn test_first_duplicate_script_wins() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    script(first.path(), "enum.sh", "# @tags: first\n");
    script(second.path(), "enum.sh", "# @tags: second\n");

    let scripts = discover_scripts(&[first.path().to_path_buf(), second.path().to_path_buf()]).unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].tags, vec!["first".to_string()]);
}

#[test]
fn test_missing_module_dir_is_ignored() {
    let scripts = discover_scripts(&[Path::new("/nonexistent/blackbird-modules").to_path_buf()]).unwrap();
    assert!(scripts.is_empty());
}

#[test]
fn test_resolve_is_deterministic() {
    let registry = ModuleRegistry::with_builtins();

    let a: Vec<String> = registry.resolve(&["http", "whois"]).unwrap().into_keys().collect();
    let b: Vec<String> = registry.resolve(&["whois", "http", "whatweb"]).unwrap().into_keys().collect();
    assert_eq!(a, b);
    assert!(a.contains(&"testssl".to_string()));
    assert!(!a.contains(&"ssh_brute".to_string()));
}

#[test]
fn test_name_selector_precedes_tag() {
    let registry = ModuleRegistry::with_builtins();
    let selected = registry.resolve(&["ssh_brute"]).unwrap();
    assert_eq!(selected.len(), 1);

    let default = registry.resolve(&["default"]).unwrap();
    assert!(default.contains_key("whois"));
    assert!(!default.contains_key("ssh_brute"));
}

#[test]
fn test_all_selects_everything() {
    let registry = ModuleRegistry::with_builtins();
    assert_eq!(registry.resolve(&["all"]).unwrap().len(), registry.len());
}

#[test]
fn test_unknown_selector_is_fatal() {
    let registry = ModuleRegistry::with_builtins();
    let err = registry.resolve(&["http", "nosuchthing"]).err().unwrap();
    assert!(matches!(err, ReconError::ModuleNotFound(ref s) if s == "nosuchthing"));
    assert!(err.is_fatal());

    let empty: [&str; 0] = [];
    assert!(matches!(registry.resolve(&empty), Err(ReconError::ConfigError(_))));
}
