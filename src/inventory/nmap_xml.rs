//! nmap XML reading, merging and writing
//!
//! Documents are held as a plain element tree so that merging keeps every
//! element and attribute name exactly as nmap wrote it. The merge is a join:
//! hosts are keyed by address, ports by `(protocol, portid)`, and every
//! conflict is settled by a total order, which makes it associative,
//! commutative and idempotent.

use super::Transport;
use crate::{ReconError, Result};
use log::{debug, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the merged scan state inside the working directory
pub const SUMMARY_FILE: &str = "nmap_summary.xml";

const STYLESHEET_PI: &str =
    r#"xml-stylesheet href="file:///usr/bin/../share/nmap/nmap.xsl" type="text/xsl""#;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// One XML element with its attributes in document order
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    /// Attributes plus nested elements, used to prefer richer port records.
    fn detail(&self) -> usize {
        self.attributes.len() + self.elements().map(|e| 1 + e.detail()).sum::<usize>()
    }
}

fn element_from_start(start: &BytesStart) -> Result<XmlElement> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(ReconError::ParseError(
                "document has more than one root element".to_string(),
            ))
        }
    }
    Ok(())
}

/// Parse an XML document into its root element.
pub fn parse_document(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ReconError::ParseError("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let text = text.unescape()?.into_owned();
                    if !text.is_empty() {
                        parent.children.push(XmlNode::Text(text));
                    }
                }
            }
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    parent.children.push(XmlNode::Text(text));
                }
            }
            Event::Eof => break,
            // declaration, doctype, processing instructions, comments
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ReconError::ParseError("unexpected end of document".to_string()));
    }

    root.ok_or_else(|| ReconError::ParseError("empty document".to_string()))
}

fn write_element<W: std::io::Write>(writer: &mut Writer<W>, element: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        match child {
            XmlNode::Element(e) => write_element(writer, e)?,
            XmlNode::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

/// Serialize a document with the nmap prologue.
pub fn write_document(root: &XmlElement) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::DocType(BytesText::from_escaped("nmaprun")))?;
    writer.write_event(Event::PI(BytesText::from_escaped(STYLESHEET_PI)))?;
    write_element(&mut writer, root)?;

    let mut xml = String::from_utf8(writer.into_inner())
        .map_err(|e| ReconError::ParseError(format!("non UTF-8 output: {}", e)))?;
    xml.push('\n');
    Ok(xml)
}

/// Read and parse a scan file. Any failure is reported as an import error
/// naming the file.
pub fn read_document<P: AsRef<Path>>(path: P) -> Result<XmlElement> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ReconError::import(path, e))?;
    let root = parse_document(&content).map_err(|e| ReconError::import(path, e))?;

    if root.name != "nmaprun" {
        return Err(ReconError::import(
            path,
            format!("root element is <{}>, expected <nmaprun>", root.name),
        ));
    }

    Ok(root)
}

/// Write a document next to its destination, then rename over it.
pub fn write_document_to<P: AsRef<Path>>(path: P, root: &XmlElement) -> Result<()> {
    let path = path.as_ref();
    let xml = write_document(root)?;
    let staging = path.with_extension("xml.tmp");
    fs::write(&staging, xml)?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn summary_root() -> XmlElement {
    XmlElement::new("nmaprun")
        .with_attr("scanner", "nmap")
        .with_attr("args", "Blackbird Summary")
        .with_attr("start", "0")
        .with_attr("startstr", "None")
        .with_attr("version", "7.70")
        .with_attr("xmloutputversion", "1.04")
}

/// First non-MAC address of a `<host>` element.
fn host_address(host: &XmlElement) -> Option<&str> {
    host.children_named("address")
        .find(|a| a.attr("addrtype") != Some("mac"))
        .and_then(|a| a.attr("addr"))
}

fn is_open(port: &XmlElement) -> bool {
    port.child("state").and_then(|s| s.attr("state")) == Some("open")
}

fn port_key(port: &XmlElement) -> Option<(String, u16)> {
    let protocol = port.attr("protocol")?.to_string();
    let portid = port.attr("portid")?.parse().ok()?;
    Some((protocol, portid))
}

#[derive(Debug, Default)]
struct HostAccumulator {
    skeleton: Option<XmlElement>,
    hostnames: BTreeSet<XmlElement>,
    ports: BTreeMap<(String, u16), XmlElement>,
}

impl HostAccumulator {
    fn absorb(&mut self, host: &XmlElement) {
        let mut skeleton = XmlElement::new(host.name.clone());
        skeleton.attributes = host.attributes.clone();
        skeleton.children = host
            .children
            .iter()
            .filter(|node| {
                !matches!(node, XmlNode::Element(e) if e.name == "ports" || e.name == "hostnames")
            })
            .cloned()
            .collect();

        self.skeleton = match self.skeleton.take() {
            Some(current) => Some(current.max(skeleton)),
            None => Some(skeleton),
        };

        for hostname in host
            .children_named("hostnames")
            .flat_map(|h| h.children_named("hostname"))
        {
            self.hostnames.insert(hostname.clone());
        }

        for port in host
            .children_named("ports")
            .flat_map(|p| p.children_named("port"))
            .filter(|p| is_open(p))
        {
            let Some(key) = port_key(port) else {
                continue;
            };
            match self.ports.get(&key) {
                Some(existing) if (existing.detail(), existing) >= (port.detail(), port) => {}
                _ => {
                    self.ports.insert(key, port.clone());
                }
            }
        }
    }

    fn into_element(self) -> Option<XmlElement> {
        let mut host = self.skeleton?;

        let insert_at = host
            .children
            .iter()
            .rposition(|node| matches!(node, XmlNode::Element(e) if e.name == "address"))
            .map(|i| i + 1)
            .unwrap_or(host.children.len());

        let mut extra = Vec::new();
        if !self.hostnames.is_empty() {
            let mut hostnames = XmlElement::new("hostnames");
            hostnames.children = self.hostnames.into_iter().map(XmlNode::Element).collect();
            extra.push(XmlNode::Element(hostnames));
        }
        if !self.ports.is_empty() {
            let mut ports = XmlElement::new("ports");
            ports.children = self.ports.into_values().map(XmlNode::Element).collect();
            extra.push(XmlNode::Element(ports));
        }

        for (offset, node) in extra.into_iter().enumerate() {
            host.children.insert(insert_at + offset, node);
        }
        Some(host)
    }
}

/// Merge any number of nmap documents into one summary document.
pub fn merge_documents<'a, I>(documents: I) -> XmlElement
where
    I: IntoIterator<Item = &'a XmlElement>,
{
    let mut hosts: BTreeMap<String, HostAccumulator> = BTreeMap::new();

    for document in documents {
        for host in document.children_named("host") {
            match host_address(host) {
                Some(address) => hosts.entry(address.to_string()).or_default().absorb(host),
                None => debug!("Skipping <host> without an IP address"),
            }
        }
    }

    let mut root = summary_root();
    root.children = hosts
        .into_values()
        .filter_map(HostAccumulator::into_element)
        .map(XmlNode::Element)
        .collect();
    root
}

/// Per-port data needed to build a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub transport: Transport,
    pub port: u16,
    pub name: String,
    pub tunnel: Option<String>,
    pub product: String,
    pub version: String,
    pub extra_info: String,
    pub fingerprint: String,
}

/// Per-host data extracted from a scan document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub address: String,
    pub hostnames: Vec<String>,
    pub ports: Vec<PortRecord>,
}

fn port_record(port: &XmlElement) -> Option<PortRecord> {
    let (protocol, portid) = port_key(port)?;
    let transport = match protocol.parse::<Transport>() {
        Ok(t) => t,
        Err(_) => {
            debug!("Ignoring {}/{}: unsupported transport", portid, protocol);
            return None;
        }
    };

    let service = port.child("service");
    let field = |name: &str| {
        service
            .and_then(|s| s.attr(name))
            .unwrap_or_default()
            .to_string()
    };

    Some(PortRecord {
        transport,
        port: portid,
        name: field("name"),
        tunnel: service
            .and_then(|s| s.attr("tunnel"))
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        product: field("product"),
        version: field("version"),
        extra_info: field("extrainfo"),
        fingerprint: field("servicefp"),
    })
}

/// Extract host records (open ports only) from a parsed document.
pub fn host_records(document: &XmlElement) -> Vec<HostRecord> {
    let mut records = Vec::new();

    for host in document.children_named("host") {
        let Some(address) = host_address(host) else {
            warn!("Skipping a host entry without an IP address");
            continue;
        };

        let hostnames = host
            .children_named("hostnames")
            .flat_map(|h| h.children_named("hostname"))
            .filter_map(|h| h.attr("name"))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        let ports = host
            .children_named("ports")
            .flat_map(|p| p.children_named("port"))
            .filter(|p| is_open(p))
            .filter_map(port_record)
            .collect();

        records.push(HostRecord {
            address: address.to_string(),
            hostnames,
            ports,
        });
    }

    records
}

/// `ParseScanFile`: read a scan file straight into host records.
pub fn parse_scan_file<P: AsRef<Path>>(path: P) -> Result<Vec<HostRecord>> {
    Ok(host_records(&read_document(path)?))
}

/// The merged scan state kept in a working directory.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    path: PathBuf,
}

impl ScanSummary {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self {
            path: workdir.as_ref().join(SUMMARY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Merge `documents` with the current summary, if any, and persist it.
    pub fn update(&self, documents: &[XmlElement]) -> Result<XmlElement> {
        let existing = if self.exists() {
            Some(read_document(&self.path)?)
        } else {
            None
        };

        let merged = merge_documents(documents.iter().chain(existing.iter()));
        write_document_to(&self.path, &merged)?;
        debug!(
            "Summary {} now holds {} hosts",
            self.path.display(),
            merged.children_named("host").count()
        );
        Ok(merged)
    }
}
