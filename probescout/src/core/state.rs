//! Scan state aggregate and the rules for folding scanner results into it.
//!
//! Invariants maintained here:
//! - `reachability` only moves away from `Unknown`, never back.
//! - `host_address`/`hostname` are set at most once.
//! - `open_ports` is unique by `(port, protocol)` and sorted by `(protocol, port)`.
//! - `services` is append-only and re-sorted by `(protocol, port)` after each update.
//! - `actions_run` is append-only.

use serde::{Deserialize, Serialize};

use crate::core::nmap_xml::ScanResult;
use crate::core::types::{ActionId, OpenPort, Protocol, Reachability};

/// One service-detection observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub port: u16,
    pub protocol: Protocol,
    pub service: Option<String>,
    pub version: Option<String>,
}

/// The OS inference retained from fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsGuess {
    pub name: String,
    pub accuracy: u8,
}

/// Facts discovered about a single target during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    target: String,
    pub reachability: Reachability,
    pub host_address: Option<String>,
    pub hostname: Option<String>,
    pub open_ports: Vec<OpenPort>,
    pub services: Vec<ServiceEntry>,
    pub os_fingerprint_done: bool,
    pub os_guess: Option<OsGuess>,
    pub actions_run: Vec<ActionId>,
    pub invocation_count: u32,
}

impl ScanState {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reachability: Reachability::Unknown,
            host_address: None,
            hostname: None,
            open_ports: Vec::new(),
            services: Vec::new(),
            os_fingerprint_done: false,
            os_guess: None,
            actions_run: Vec::new(),
            invocation_count: 0,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn has_run(&self, action: ActionId) -> bool {
        self.actions_run.contains(&action)
    }

    pub fn has_run_service_detect(&self) -> bool {
        self.actions_run.iter().any(|action| action.is_service_detect())
    }

    /// Fold host-discovery output into the state.
    ///
    /// Missing or unparsable output, or a document without hosts, means the
    /// target did not respond.
    pub fn apply_discovery_result(&mut self, result: Option<&ScanResult>) {
        let Some(host) = result.and_then(ScanResult::first_host) else {
            self.set_reachability(Reachability::NoResponse);
            return;
        };
        self.set_reachability(host.reachability());
        if self.host_address.is_none() {
            self.host_address = host.address.clone();
        }
        if self.hostname.is_none() {
            self.hostname = host.hostname.clone();
        }
    }

    /// Merge open ports from a port scan. Re-applying the same result is a no-op.
    ///
    /// A host reported up also fills in reachability and address under the
    /// same set-once rules as discovery. A silent host says nothing here.
    pub fn apply_port_scan_result(&mut self, result: Option<&ScanResult>) {
        let Some(result) = result else {
            return;
        };
        if let Some(host) = result
            .first_host()
            .filter(|host| host.reachability() == Reachability::Up)
        {
            self.set_reachability(Reachability::Up);
            if self.host_address.is_none() {
                self.host_address = host.address.clone();
            }
            if self.hostname.is_none() {
                self.hostname = host.hostname.clone();
            }
        }
        for host in &result.hosts {
            for port in host.open_ports() {
                let key = port.key();
                if !self.open_ports.contains(&key) {
                    self.open_ports.push(key);
                }
            }
        }
        self.open_ports.sort();
    }

    /// Append service observations for open ports from a service-detection scan.
    pub fn apply_service_result(&mut self, result: Option<&ScanResult>) {
        let Some(result) = result else {
            return;
        };
        for host in &result.hosts {
            for port in host.open_ports() {
                let (service, version) = match &port.service {
                    Some(info) => (
                        info.name.clone().or_else(|| info.product.clone()),
                        info.version.clone(),
                    ),
                    None => (None, None),
                };
                self.services.push(ServiceEntry {
                    port: port.port,
                    protocol: port.protocol,
                    service,
                    version,
                });
            }
        }
        self.services
            .sort_by(|a, b| (a.protocol, a.port).cmp(&(b.protocol, b.port)));
    }

    /// Record a fingerprinting run and keep the best OS candidate.
    ///
    /// `os_fingerprint_done` is set even when nothing conclusive was parsed.
    pub fn apply_fingerprint_result(&mut self, result: Option<&ScanResult>) {
        self.os_fingerprint_done = true;
        let Some(best) = result.and_then(ScanResult::best_os_match) else {
            return;
        };
        let improves = self
            .os_guess
            .as_ref()
            .is_none_or(|current| best.accuracy > current.accuracy);
        if improves {
            self.os_guess = Some(OsGuess {
                name: best.name.clone(),
                accuracy: best.accuracy,
            });
        }
    }

    /// Apply one executed action: fold its result, record it, count the invocation.
    pub fn record_invocation(&mut self, action: ActionId, result: Option<&ScanResult>) {
        match action {
            ActionId::HostReachability => self.apply_discovery_result(result),
            ActionId::PortScan => self.apply_port_scan_result(result),
            ActionId::ServiceDetect | ActionId::ServiceDetectCommon => {
                self.apply_service_result(result);
            }
            ActionId::OsFingerprint => self.apply_fingerprint_result(result),
            ActionId::Done => {}
        }
        self.actions_run.push(action);
        self.invocation_count += 1;
    }

    /// Record an action that was accepted but not executed (dry run).
    pub fn record_skipped(&mut self, action: ActionId) {
        self.actions_run.push(action);
    }

    fn set_reachability(&mut self, next: Reachability) {
        if self.reachability == Reachability::Unknown {
            self.reachability = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nmap_xml::{HostRecord, OsMatch, PortRecord, ServiceInfo};

    fn port(port: u16, protocol: Protocol, state: &str) -> PortRecord {
        PortRecord {
            port,
            protocol,
            state: state.to_string(),
            service: None,
        }
    }

    fn result_with_ports(ports: Vec<PortRecord>) -> ScanResult {
        ScanResult {
            hosts: vec![HostRecord {
                status: Some("up".to_string()),
                ports,
                ..HostRecord::default()
            }],
        }
    }

    #[test]
    fn discovery_sets_reachability_address_and_hostname() {
        let mut state = ScanState::new("10.0.0.5");
        let result = ScanResult {
            hosts: vec![HostRecord {
                status: Some("up".to_string()),
                address: Some("10.0.0.5".to_string()),
                hostname: Some("box.lan".to_string()),
                ..HostRecord::default()
            }],
        };
        state.apply_discovery_result(Some(&result));
        assert_eq!(state.reachability, Reachability::Up);
        assert_eq!(state.host_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(state.hostname.as_deref(), Some("box.lan"));
    }

    #[test]
    fn discovery_without_output_means_no_response() {
        let mut state = ScanState::new("10.0.0.5");
        state.apply_discovery_result(None);
        assert_eq!(state.reachability, Reachability::NoResponse);

        let mut state = ScanState::new("10.0.0.5");
        state.apply_discovery_result(Some(&ScanResult::default()));
        assert_eq!(state.reachability, Reachability::NoResponse);
    }

    #[test]
    fn reachability_never_reverts() {
        let mut state = ScanState::new("t");
        state.apply_discovery_result(Some(&result_with_ports(Vec::new())));
        assert_eq!(state.reachability, Reachability::Up);
        state.apply_discovery_result(None);
        assert_eq!(state.reachability, Reachability::Up);
    }

    #[test]
    fn address_is_set_at_most_once() {
        let mut state = ScanState::new("t");
        let first = ScanResult {
            hosts: vec![HostRecord {
                status: Some("up".to_string()),
                address: Some("10.0.0.1".to_string()),
                ..HostRecord::default()
            }],
        };
        let second = ScanResult {
            hosts: vec![HostRecord {
                status: Some("up".to_string()),
                address: Some("10.0.0.2".to_string()),
                ..HostRecord::default()
            }],
        };
        state.apply_discovery_result(Some(&first));
        state.apply_discovery_result(Some(&second));
        assert_eq!(state.host_address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn port_scan_keeps_unique_sorted_open_ports() {
        let mut state = ScanState::new("t");
        state.apply_port_scan_result(Some(&result_with_ports(vec![
            port(443, Protocol::Tcp, "open"),
            port(53, Protocol::Udp, "open"),
            port(22, Protocol::Tcp, "open"),
            port(25, Protocol::Tcp, "closed"),
        ])));
        state.apply_port_scan_result(Some(&result_with_ports(vec![
            port(80, Protocol::Tcp, "open"),
            port(22, Protocol::Tcp, "open"),
        ])));
        assert_eq!(
            state.open_ports,
            vec![
                OpenPort::tcp(22),
                OpenPort::tcp(80),
                OpenPort::tcp(443),
                OpenPort::new(53, Protocol::Udp),
            ]
        );
    }

    #[test]
    fn reapplying_port_scan_is_idempotent() {
        let mut state = ScanState::new("t");
        let result = result_with_ports(vec![
            port(80, Protocol::Tcp, "open"),
            port(8080, Protocol::Tcp, "open"),
        ]);
        state.apply_port_scan_result(Some(&result));
        let before = state.open_ports.len();
        state.apply_port_scan_result(Some(&result));
        assert_eq!(state.open_ports.len(), before);
    }

    #[test]
    fn service_entries_use_product_when_name_missing() {
        let mut state = ScanState::new("t");
        let mut ssh = port(22, Protocol::Tcp, "open");
        ssh.service = Some(ServiceInfo {
            name: Some("ssh".to_string()),
            product: Some("OpenSSH".to_string()),
            version: Some("8.9p1".to_string()),
        });
        let mut web = port(8080, Protocol::Tcp, "open");
        web.service = Some(ServiceInfo {
            name: None,
            product: Some("Jetty".to_string()),
            version: None,
        });
        state.apply_service_result(Some(&result_with_ports(vec![web, ssh])));
        assert_eq!(state.services.len(), 2);
        assert_eq!(state.services[0].port, 22);
        assert_eq!(state.services[0].service.as_deref(), Some("ssh"));
        assert_eq!(state.services[0].version.as_deref(), Some("8.9p1"));
        assert_eq!(state.services[1].service.as_deref(), Some("Jetty"));
        assert_eq!(state.services[1].version, None);
    }

    #[test]
    fn product_alone_is_not_a_version() {
        let mut state = ScanState::new("t");
        let mut web = port(80, Protocol::Tcp, "open");
        web.service = Some(ServiceInfo {
            name: Some("http".to_string()),
            product: Some("Jetty".to_string()),
            version: None,
        });
        state.apply_service_result(Some(&result_with_ports(vec![web])));
        assert_eq!(
            state.services,
            vec![ServiceEntry {
                port: 80,
                protocol: Protocol::Tcp,
                service: Some("http".to_string()),
                version: None,
            }]
        );
    }

    #[test]
    fn port_scan_of_up_host_sets_reachability_address_and_ports() {
        let mut state = ScanState::new("10.0.0.5");
        let result = ScanResult {
            hosts: vec![HostRecord {
                status: Some("up".to_string()),
                address: Some("10.0.0.5".to_string()),
                ports: vec![port(80, Protocol::Tcp, "open")],
                ..HostRecord::default()
            }],
        };
        state.apply_port_scan_result(Some(&result));
        assert_eq!(state.reachability, Reachability::Up);
        assert_eq!(state.host_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(state.open_ports, vec![OpenPort::tcp(80)]);
    }

    #[test]
    fn port_scan_of_silent_host_leaves_reachability_unknown() {
        let mut state = ScanState::new("10.0.0.5");
        let result = ScanResult {
            hosts: vec![HostRecord {
                status: Some("down".to_string()),
                ..HostRecord::default()
            }],
        };
        state.apply_port_scan_result(Some(&result));
        state.apply_port_scan_result(None);
        assert_eq!(state.reachability, Reachability::Unknown);
        assert!(state.host_address.is_none());
    }

    #[test]
    fn fingerprint_marks_done_and_keeps_most_accurate_guess() {
        let mut state = ScanState::new("t");
        state.apply_fingerprint_result(None);
        assert!(state.os_fingerprint_done);
        assert!(state.os_guess.is_none());

        let result = ScanResult {
            hosts: vec![HostRecord {
                os_matches: vec![
                    OsMatch {
                        name: "Linux 4.15".to_string(),
                        accuracy: 80,
                    },
                    OsMatch {
                        name: "Linux 5.4".to_string(),
                        accuracy: 95,
                    },
                ],
                ..HostRecord::default()
            }],
        };
        state.apply_fingerprint_result(Some(&result));
        assert_eq!(
            state.os_guess.as_ref().map(|g| g.name.as_str()),
            Some("Linux 5.4")
        );

        let weaker = ScanResult {
            hosts: vec![HostRecord {
                os_matches: vec![OsMatch {
                    name: "FreeBSD".to_string(),
                    accuracy: 90,
                }],
                ..HostRecord::default()
            }],
        };
        state.apply_fingerprint_result(Some(&weaker));
        assert_eq!(
            state.os_guess.as_ref().map(|g| g.name.as_str()),
            Some("Linux 5.4")
        );
    }

    #[test]
    fn record_invocation_appends_action_and_counts() {
        let mut state = ScanState::new("t");
        state.record_invocation(ActionId::PortScan, None);
        state.record_skipped(ActionId::OsFingerprint);
        assert_eq!(
            state.actions_run,
            vec![ActionId::PortScan, ActionId::OsFingerprint]
        );
        assert_eq!(state.invocation_count, 1);
        assert!(!state.os_fingerprint_done);
    }
}
