//! Shared deterministic types for the scan core.
//!
//! These types define stable contracts between core components. They carry no
//! I/O and serialize with stable snake_case names for status and report output.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether the target answered host discovery.
///
/// Transitions only `Unknown -> Up` or `Unknown -> NoResponse`; never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Unknown,
    Up,
    NoResponse,
}

impl Reachability {
    pub fn as_str(self) -> &'static str {
        match self {
            Reachability::Unknown => "unknown",
            Reachability::Up => "up",
            Reachability::NoResponse => "no_response",
        }
    }
}

/// Transport protocol of a scanned port.
///
/// Variant order defines the presentation order (`tcp` before `udp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parse a scanner protocol attribute. Anything other than tcp/udp is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open port, unique by `(port, protocol)`.
///
/// `Ord` compares protocol first, then port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpenPort {
    pub protocol: Protocol,
    pub port: u16,
}

impl OpenPort {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { protocol, port }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(port, Protocol::Tcp)
    }
}

impl fmt::Display for OpenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Scope requested for service detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceScope {
    All,
    Common,
}

impl ServiceScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(ServiceScope::All),
            "common" => Some(ServiceScope::Common),
            _ => None,
        }
    }
}

/// Canonical identifier of an executed (or finishing) action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionId {
    HostReachability,
    PortScan,
    ServiceDetect,
    ServiceDetectCommon,
    OsFingerprint,
    Done,
}

impl ActionId {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionId::HostReachability => "host_reachability",
            ActionId::PortScan => "port_scan",
            ActionId::ServiceDetect => "service_detect",
            ActionId::ServiceDetectCommon => "service_detect_common",
            ActionId::OsFingerprint => "os_fingerprint",
            ActionId::Done => "done",
        }
    }

    /// Human-readable stage label for reports and status output.
    pub fn label(self) -> &'static str {
        match self {
            ActionId::HostReachability => "Host check",
            ActionId::PortScan => "Port scan",
            ActionId::ServiceDetect => "Service detection",
            ActionId::ServiceDetectCommon => "Service detection (common ports)",
            ActionId::OsFingerprint => "OS fingerprint",
            ActionId::Done => "Done",
        }
    }

    pub fn is_service_detect(self) -> bool {
        matches!(self, ActionId::ServiceDetect | ActionId::ServiceDetectCommon)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ports probed by `service_detect` with scope `common`.
pub const COMMON_PORTS: [u16; 5] = [22, 80, 443, 8080, 8443];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_ports_order_by_protocol_then_port() {
        let mut ports = vec![
            OpenPort::new(53, Protocol::Udp),
            OpenPort::tcp(443),
            OpenPort::tcp(22),
            OpenPort::new(7, Protocol::Udp),
        ];
        ports.sort();
        let rendered: Vec<String> = ports.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["22/tcp", "443/tcp", "7/udp", "53/udp"]);
    }

    #[test]
    fn action_ids_serialize_as_snake_case() {
        let json = serde_json::to_string(&ActionId::ServiceDetectCommon).expect("serialize");
        assert_eq!(json, "\"service_detect_common\"");
        assert_eq!(ActionId::HostReachability.as_str(), "host_reachability");
    }

    #[test]
    fn protocol_parse_rejects_other_transports() {
        assert_eq!(Protocol::parse(" TCP "), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse("sctp"), None);
    }
}
