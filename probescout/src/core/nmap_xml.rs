//! Typed records parsed from the scanner's structured (XML) output.
//!
//! Element names are matched by local name, so namespaced and unnamespaced
//! documents parse identically. Parsing never fails the run: callers get
//! `None` for empty or malformed documents and treat that as "no data".

use roxmltree::{Document, Node, ParsingOptions};
use tracing::debug;

use crate::core::types::{OpenPort, Protocol, Reachability};

/// Parsed structured result of one scanner invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub hosts: Vec<HostRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRecord {
    /// Raw `status/@state` (lowercased), e.g. `up` or `down`.
    pub status: Option<String>,
    pub address: Option<String>,
    pub hostname: Option<String>,
    pub ports: Vec<PortRecord>,
    pub os_matches: Vec<OsMatch>,
}

impl HostRecord {
    pub fn reachability(&self) -> Reachability {
        match self.status.as_deref() {
            Some("up") => Reachability::Up,
            _ => Reachability::NoResponse,
        }
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &PortRecord> {
        self.ports.iter().filter(|port| port.is_open())
    }

    /// Highest-accuracy OS candidate; the first one listed wins ties.
    pub fn best_os_match(&self) -> Option<&OsMatch> {
        self.os_matches
            .iter()
            .fold(None, |best: Option<&OsMatch>, candidate| match best {
                Some(current) if current.accuracy >= candidate.accuracy => Some(current),
                _ => Some(candidate),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: Protocol,
    /// Raw `state/@state` (lowercased), e.g. `open`, `closed`, `filtered`.
    pub state: String,
    pub service: Option<ServiceInfo>,
}

impl PortRecord {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn key(&self) -> OpenPort {
        OpenPort::new(self.port, self.protocol)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsMatch {
    pub name: String,
    pub accuracy: u8,
}

impl ScanResult {
    pub fn first_host(&self) -> Option<&HostRecord> {
        self.hosts.first()
    }

    /// Highest-accuracy OS candidate across all hosts.
    pub fn best_os_match(&self) -> Option<&OsMatch> {
        self.hosts
            .iter()
            .filter_map(HostRecord::best_os_match)
            .fold(None, |best: Option<&OsMatch>, candidate| match best {
                Some(current) if current.accuracy >= candidate.accuracy => Some(current),
                _ => Some(candidate),
            })
    }
}

/// Parse scanner XML output. Returns `None` for empty or malformed documents.
pub fn parse_scan_xml(xml: &str) -> Option<ScanResult> {
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Scanner output carries a DOCTYPE line.
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let doc = match Document::parse_with_options(trimmed, options) {
        Ok(doc) => doc,
        Err(err) => {
            debug!(err = %err, "scanner xml did not parse");
            return None;
        }
    };

    let hosts = children_named(doc.root_element(), "host")
        .map(parse_host)
        .collect();
    Some(ScanResult { hosts })
}

fn parse_host(host: Node<'_, '_>) -> HostRecord {
    let status = child_named(host, "status")
        .and_then(|node| node.attribute("state"))
        .map(|raw| raw.trim().to_ascii_lowercase());

    // Prefer a network address over a MAC address.
    let address = children_named(host, "address")
        .filter(|node| matches!(node.attribute("addrtype"), Some("ipv4") | Some("ipv6") | None))
        .find_map(|node| non_empty(node.attribute("addr")));

    let hostname = child_named(host, "hostnames")
        .into_iter()
        .flat_map(|node| children_named(node, "hostname"))
        .find_map(|node| non_empty(node.attribute("name")));

    let ports = child_named(host, "ports")
        .into_iter()
        .flat_map(|node| children_named(node, "port"))
        .filter_map(parse_port)
        .collect();

    let os_matches = child_named(host, "os")
        .into_iter()
        .flat_map(|node| children_named(node, "osmatch"))
        .filter_map(|node| {
            let name = non_empty(node.attribute("name"))?;
            let accuracy = node
                .attribute("accuracy")
                .and_then(|raw| raw.trim().parse::<u8>().ok())
                .unwrap_or(0);
            Some(OsMatch { name, accuracy })
        })
        .collect();

    HostRecord {
        status,
        address,
        hostname,
        ports,
        os_matches,
    }
}

fn parse_port(node: Node<'_, '_>) -> Option<PortRecord> {
    let port = node
        .attribute("portid")
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .filter(|port| *port > 0)?;
    let protocol = Protocol::parse(node.attribute("protocol").unwrap_or("tcp"))?;
    let state = child_named(node, "state")
        .and_then(|state| state.attribute("state"))
        .map(|raw| raw.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let service = child_named(node, "service").map(|svc| ServiceInfo {
        name: non_empty(svc.attribute("name")),
        product: non_empty(svc.attribute("product")),
        version: non_empty(svc.attribute("version")),
    });
    Some(PortRecord {
        port,
        protocol,
        state,
        service,
    })
}

fn children_named<'a, 'input: 'a>(
    parent: Node<'a, 'input>,
    local: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    parent
        .children()
        .filter(move |child| child.is_element() && child.tag_name().name() == local)
}

fn child_named<'a, 'input: 'a>(
    parent: Node<'a, 'input>,
    local: &'static str,
) -> Option<Node<'a, 'input>> {
    children_named(parent, local).next()
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
