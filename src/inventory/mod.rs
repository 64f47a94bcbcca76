//! Host and service inventory
//!
//! The inventory is rebuilt on every run from the merged scan summary. A host
//! is keyed by its IP address for its whole life; hostnames only ever
//! accumulate in a side set. A service is keyed by `(address, transport,
//! port)` and re-importing a port overwrites its fields in place.

pub mod nmap_xml;

pub use nmap_xml::{HostRecord, PortRecord, ScanSummary, XmlElement};

use crate::{ReconError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transport protocol of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl FromStr for Transport {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(ReconError::ParseError(format!("unknown transport '{}'", other))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// How missing or malformed scan files are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Explicit imports: any bad file aborts the import
    Strict,
    /// Sweeps: bad files are skipped with a warning
    BestEffort,
}

/// Read scan documents, applying `mode` to files that cannot be used.
pub fn read_scan_documents<P: AsRef<Path>>(paths: &[P], mode: ImportMode) -> Result<Vec<XmlElement>> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        match nmap_xml::read_document(path) {
            Ok(document) => documents.push(document),
            Err(e) if mode == ImportMode::BestEffort => warn!("Skipping scan file: {}", e),
            Err(e) => return Err(e),
        }
    }
    Ok(documents)
}

/// `*.xml` files directly in `dir` and one level below it, in path order.
pub fn sweep_scan_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    fn is_xml(path: &Path) -> bool {
        path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("xml")
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if !path.is_dir() {
            if is_xml(&path) {
                files.push(path);
            }
            continue;
        }
        match fs::read_dir(&path) {
            Ok(nested) => files.extend(
                nested
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| is_xml(p)),
            ),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }

    files.sort();
    Ok(files)
}

/// One open port on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Address of the owning host
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    /// Application protocol as identified by the scanner (`http`, `ssh`, ...)
    pub name: String,
    pub tunnel: Option<String>,
    pub product: String,
    pub version: String,
    pub extra_info: String,
    pub fingerprint: String,
}

impl Service {
    pub fn new<S: Into<String>>(host: S, transport: Transport, port: u16, name: S) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            name: name.into(),
            tunnel: None,
            product: String::new(),
            version: String::new(),
            extra_info: String::new(),
            fingerprint: String::new(),
        }
    }

    fn from_record(host: &str, record: &PortRecord) -> Self {
        Self {
            host: host.to_string(),
            port: record.port,
            transport: record.transport,
            name: record.name.clone(),
            tunnel: record.tunnel.clone(),
            product: record.product.clone(),
            version: record.version.clone(),
            extra_info: record.extra_info.clone(),
            fingerprint: record.fingerprint.clone(),
        }
    }

    pub fn key(&self) -> (Transport, u16) {
        (self.transport, self.port)
    }

    /// Whether the service speaks TLS
    pub fn is_tls(&self) -> bool {
        self.name == "https" || self.tunnel.as_deref() == Some("ssl") || self.port == 443
    }

    /// Case-insensitive match on the descriptive fields, exact match on port.
    fn matches_keyword(&self, keyword: &str) -> bool {
        let needle = keyword.to_lowercase();
        [
            &self.name,
            &self.product,
            &self.version,
            &self.extra_info,
            &self.fingerprint,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
            || keyword.parse::<u16>().map(|p| p == self.port).unwrap_or(false)
    }

    /// `name product version extrainfo` with empty fields skipped
    pub fn banner(&self) -> String {
        [&self.name, &self.product, &self.version, &self.extra_info]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

/// A network endpoint with its hostnames and open services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub hostnames: BTreeSet<String>,
    services: BTreeMap<(Transport, u16), Service>,
}

impl Host {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            hostnames: BTreeSet::new(),
            services: BTreeMap::new(),
        }
    }

    /// Returns false when the hostname was already known.
    pub fn add_hostname<S: Into<String>>(&mut self, hostname: S) -> bool {
        let hostname = hostname.into();
        if hostname.is_empty() || hostname == self.address {
            return false;
        }
        self.hostnames.insert(hostname)
    }

    /// Insert a service, overwriting any service on the same transport and port.
    pub fn upsert_service(&mut self, mut service: Service) {
        service.host = self.address.clone();
        self.services.insert(service.key(), service);
    }

    /// Services in `(transport, port)` order
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn service(&self, transport: Transport, port: u16) -> Option<&Service> {
        self.services.get(&(transport, port))
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Hostnames followed by the address
    pub fn names(&self) -> Vec<String> {
        self.hostnames
            .iter()
            .cloned()
            .chain(std::iter::once(self.address.clone()))
            .collect()
    }

    pub fn is_known_as(&self, name: &str) -> bool {
        self.address == name || self.hostnames.contains(name)
    }
}

/// All hosts known to a run, keyed by address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    hosts: BTreeMap<String, Host>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn host(&self, address: &str) -> Option<&Host> {
        self.hosts.get(address)
    }

    pub fn service_count(&self) -> usize {
        self.hosts.values().map(Host::service_count).sum()
    }

    /// Get or create the host with `address`.
    pub fn upsert_host(&mut self, address: &str) -> &mut Host {
        self.hosts
            .entry(address.to_string())
            .or_insert_with(|| Host::new(address))
    }

    /// Upsert hosts, hostnames and services from parsed records.
    pub fn apply_records(&mut self, records: &[HostRecord]) {
        for record in records {
            let host = self.upsert_host(&record.address);
            for hostname in &record.hostnames {
                host.add_hostname(hostname.as_str());
            }
            for port in &record.ports {
                host.upsert_service(Service::from_record(&record.address, port));
            }
        }
    }

    /// `ImportScan`: parse every file and upsert its content.
    ///
    /// Returns the number of files that were imported.
    pub fn import_scan<P: AsRef<Path>>(&mut self, paths: &[P], mode: ImportMode) -> Result<usize> {
        let mut imported = 0;

        for path in paths {
            let path = path.as_ref();
            match nmap_xml::parse_scan_file(path) {
                Ok(records) => {
                    debug!("{}: {} hosts", path.display(), records.len());
                    self.apply_records(&records);
                    imported += 1;
                }
                Err(e) if mode == ImportMode::BestEffort => {
                    warn!("Skipping scan file: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(imported)
    }

    /// `MergeHostnames`: read `ADDRESS name1,name2,...` lines.
    ///
    /// Addresses that are not in the inventory only produce a warning.
    pub fn merge_hostnames<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ReconError::ConfigError(format!("Cannot read hostname file {}: {}", path.display(), e))
        })?;

        let mut added = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let address = parts.next().unwrap_or_default();
            let names = parts.next().unwrap_or_default();

            let Some(host) = self.hosts.get_mut(address) else {
                warn!("Hostname file entry for unknown host {}", address);
                continue;
            };

            for name in names
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|n| !n.is_empty())
            {
                if host.add_hostname(name) {
                    added += 1;
                }
            }
        }

        info!("Added {} hostnames from {}", added, path.display());
        Ok(added)
    }

    /// `Resolve`: comma-separated addresses or hostnames, `None` for every host.
    pub fn resolve(&self, targets: Option<&str>) -> Result<Vec<&Host>> {
        let Some(spec) = targets else {
            return Ok(self.hosts.values().collect());
        };

        let mut selected = BTreeSet::new();
        for target in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let matches: Vec<&String> = self
                .hosts
                .values()
                .filter(|h| h.is_known_as(target))
                .map(|h| &h.address)
                .collect();

            if matches.is_empty() {
                return Err(ReconError::InvalidTarget(format!(
                    "'{}' is neither a known address nor a known hostname",
                    target
                )));
            }
            selected.extend(matches);
        }

        if selected.is_empty() {
            return Err(ReconError::InvalidTarget("empty target list".to_string()));
        }

        Ok(selected
            .into_iter()
            .filter_map(|address| self.hosts.get(address))
            .collect())
    }

    /// `Find`: services matching a keyword, each reported once.
    pub fn find(&self, keyword: &str) -> Vec<&Service> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Vec::new();
        }

        self.hosts
            .values()
            .flat_map(|host| {
                let host_match = host.is_known_as(keyword);
                host.services()
                    .filter(move |service| host_match || service.matches_keyword(keyword))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Inventory {
        let mut inventory = Inventory::new();
        let host = inventory.upsert_host("10.0.0.5");
        host.add_hostname("web.example.com");
        host.upsert_service(Service::new("10.0.0.5", Transport::Tcp, 80, "http"));
        host.upsert_service(Service::new("10.0.0.5", Transport::Tcp, 22, "ssh"));
        inventory
            .upsert_host("10.0.0.6")
            .upsert_service(Service::new("10.0.0.6", Transport::Udp, 161, "snmp"));
        inventory
    }

    #[test]
    fn test_upsert_overwrites_same_port() {
        let mut inventory = sample();
        let mut replacement = Service::new("10.0.0.5", Transport::Tcp, 80, "http");
        replacement.product = "Apache".to_string();
        inventory.upsert_host("10.0.0.5").upsert_service(replacement);

        let host = inventory.host("10.0.0.5").unwrap();
        assert_eq!(host.service_count(), 2);
        assert_eq!(host.service(Transport::Tcp, 80).unwrap().product, "Apache");
    }

    #[test]
    fn test_same_port_different_transport_is_distinct() {
        let mut host = Host::new("10.0.0.7");
        host.upsert_service(Service::new("10.0.0.7", Transport::Tcp, 53, "domain"));
        host.upsert_service(Service::new("10.0.0.7", Transport::Udp, 53, "domain"));
        assert_eq!(host.service_count(), 2);
    }

    #[test]
    fn test_resolve_by_hostname_and_address() {
        let inventory = sample();
        let hosts = inventory.resolve(Some("web.example.com,10.0.0.6")).unwrap();
        let addresses: Vec<_> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.5", "10.0.0.6"]);
        assert_eq!(inventory.resolve(None).unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_unknown_target_fails() {
        let inventory = sample();
        assert!(matches!(
            inventory.resolve(Some("10.0.0.5,nowhere.example.com")),
            Err(ReconError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_find_by_fields() {
        let inventory = sample();
        assert_eq!(inventory.find("HTTP").len(), 1);
        assert_eq!(inventory.find("22").len(), 1);
        assert_eq!(inventory.find("2").len(), 0);
        assert_eq!(inventory.find("web.example.com").len(), 2);
        assert_eq!(inventory.find("10.0.0.6").len(), 1);
    }

    #[test]
    fn test_tls_detection() {
        let mut service = Service::new("10.0.0.5", Transport::Tcp, 8443, "http");
        assert!(!service.is_tls());
        service.tunnel = Some("ssl".to_string());
        assert!(service.is_tls());
        assert!(Service::new("10.0.0.5", Transport::Tcp, 443, "http").is_tls());
    }
}
