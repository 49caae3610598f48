//! Invocation compiler: validated action in, concrete scanner argv out.
//!
//! The flag surface is a fixed allow-list per action. Intent parameters only
//! reach the argv through the validated port range and service scope; no
//! action can add scripting, aggressive or input-list flags.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::port_range::PortRange;
use crate::core::types::{ActionId, COMMON_PORTS, OpenPort, Protocol, ServiceScope};
use crate::core::validator::{Action, ActionKind};

/// Preferred closed port added to OS fingerprinting so the scanner sees
/// both an open and a closed response. The next port up is used when it is
/// known to be open.
pub const CLOSED_PORT_CANDIDATE: u16 = 1;
/// Known open ports handed to OS fingerprinting.
pub const MAX_FINGERPRINT_PORTS: usize = 3;

const ELEVATION_PROGRAM: &str = "sudo";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{0} needs a raw-socket scan mode but elevated execution is disabled")]
    ElevationRequired(ActionId),
}

/// Scanner settings the compiler needs from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Scanner binary (name on PATH or absolute path).
    pub program: String,
    pub elevation_enabled: bool,
    pub scan_timeout: Duration,
    /// Timeout for exhaustive `1-65535` invocations.
    pub full_range_timeout: Duration,
}

/// A fully specified scanner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub action: ActionId,
    pub program: String,
    pub args: Vec<String>,
    pub elevated: bool,
    /// Scan timeout handed to the scanner; the engine adds its grace period on top.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Invocation {
    /// Space-joined command for display and logs. Never executed through a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elevation {
    Never,
    Required,
    IfEnabled,
}

/// Compile an action into an invocation. `done` compiles to `None`.
pub fn compile(
    action: &Action,
    target: &str,
    policy: &ScanPolicy,
    known_open_ports: &[OpenPort],
) -> Result<Option<Invocation>, CompileError> {
    let id = action.id();
    let (elevation, flags, ports) = match &action.kind {
        ActionKind::Done => return Ok(None),
        ActionKind::HostReachability => (Elevation::Never, vec!["-sn"], None),
        ActionKind::PortScan { range } => (
            Elevation::Required,
            vec!["-sS"],
            Some(PortArg::Range(range.clone())),
        ),
        ActionKind::ServiceDetect { scope } => (
            Elevation::Required,
            vec!["-sS", "-sV"],
            Some(service_ports(*scope, known_open_ports)),
        ),
        ActionKind::OsFingerprint => (
            Elevation::IfEnabled,
            vec!["-O"],
            fingerprint_ports(known_open_ports),
        ),
    };

    let elevated = match elevation {
        Elevation::Never => false,
        Elevation::IfEnabled => policy.elevation_enabled,
        Elevation::Required if policy.elevation_enabled => true,
        Elevation::Required => return Err(CompileError::ElevationRequired(id)),
    };

    let timeout = if ports.as_ref().is_some_and(PortArg::is_full) {
        policy.full_range_timeout
    } else {
        policy.scan_timeout
    };

    let mut scan_args: Vec<String> = flags.into_iter().map(str::to_string).collect();
    if let Some(ports) = ports {
        scan_args.push("-p".to_string());
        scan_args.push(ports.render());
    }
    if matches!(id, ActionId::PortScan | ActionId::ServiceDetect | ActionId::ServiceDetectCommon) {
        scan_args.push("-T4".to_string());
    }
    scan_args.extend([
        "-vv".to_string(),
        "--host-timeout".to_string(),
        format!("{}s", timeout.as_secs()),
        "-oX".to_string(),
        "-".to_string(),
        target.to_string(),
    ]);

    let (program, args) = if elevated {
        let mut args = vec!["-n".to_string(), policy.program.clone()];
        args.extend(scan_args);
        (ELEVATION_PROGRAM.to_string(), args)
    } else {
        (policy.program.clone(), scan_args)
    };

    Ok(Some(Invocation {
        action: id,
        program,
        args,
        elevated,
        timeout,
    }))
}

enum PortArg {
    Range(PortRange),
    List(Vec<u16>),
}

impl PortArg {
    fn is_full(&self) -> bool {
        matches!(self, PortArg::Range(range) if range.is_full())
    }

    fn render(&self) -> String {
        match self {
            PortArg::Range(range) => range.to_string(),
            PortArg::List(ports) => ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn distinct_ports(ports: impl Iterator<Item = u16>) -> Vec<u16> {
    ports.collect::<BTreeSet<_>>().into_iter().collect()
}

fn service_ports(scope: ServiceScope, known: &[OpenPort]) -> PortArg {
    let all = distinct_ports(known.iter().map(|open| open.port));
    if all.is_empty() {
        return PortArg::Range(PortRange::full());
    }
    match scope {
        ServiceScope::All => PortArg::List(all),
        ServiceScope::Common => {
            let common: Vec<u16> = all
                .iter()
                .copied()
                .filter(|port| COMMON_PORTS.contains(port))
                .collect();
            if common.is_empty() {
                PortArg::List(all)
            } else {
                PortArg::List(common)
            }
        }
    }
}

fn fingerprint_ports(known: &[OpenPort]) -> Option<PortArg> {
    let mut ports: Vec<u16> = known
        .iter()
        .filter(|open| open.protocol == Protocol::Tcp)
        .map(|open| open.port)
        .take(MAX_FINGERPRINT_PORTS)
        .collect();
    if ports.is_empty() {
        return None;
    }
    let closed = (CLOSED_PORT_CANDIDATE..=u16::MAX).find(|port| !known.contains(&OpenPort::tcp(*port)));
    ports.extend(closed);
    Some(PortArg::List(ports))
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intent::{Intent, IntentKind, IntentParams};

    fn policy(elevation_enabled: bool) -> ScanPolicy {
        ScanPolicy {
            program: "nmap".to_string(),
            elevation_enabled,
            scan_timeout: Duration::from_secs(300),
            full_range_timeout: Duration::from_secs(3600),
        }
    }

    fn action(kind: ActionKind) -> Action {
        Action {
            kind,
            intent: Intent {
                kind: IntentKind::Done,
                params: IntentParams::default(),
                reason: None,
                reasoning: None,
                plan: None,
            },
        }
    }

    fn port_scan(range: &str) -> Action {
        action(ActionKind::PortScan {
            range: PortRange::parse(range).expect("range"),
        })
    }

    fn compiled(action: &Action, elevation: bool, known: &[OpenPort]) -> Invocation {
        compile(action, "10.0.0.5", &policy(elevation), known)
            .expect("compile")
            .expect("invocation")
    }

    #[test]
    fn done_has_no_invocation() {
        let result = compile(&action(ActionKind::Done), "t", &policy(true), &[]).expect("compile");
        assert!(result.is_none());
    }

    #[test]
    fn host_discovery_never_elevates() {
        let invocation = compiled(&action(ActionKind::HostReachability), true, &[]);
        assert!(!invocation.elevated);
        assert_eq!(invocation.program, "nmap");
        assert_eq!(
            invocation.args,
            vec!["-sn", "-vv", "--host-timeout", "300s", "-oX", "-", "10.0.0.5"]
        );
    }

    #[test]
    fn port_scan_runs_elevated_with_validated_range() {
        let invocation = compiled(&port_scan("1-1024"), true, &[]);
        assert!(invocation.elevated);
        assert_eq!(invocation.program, "sudo");
        assert_eq!(
            invocation.command_line(),
            "sudo -n nmap -sS -p 1-1024 -T4 -vv --host-timeout 300s -oX - 10.0.0.5"
        );
        assert_eq!(invocation.timeout, Duration::from_secs(300));
    }

    #[test]
    fn full_range_port_scan_gets_long_timeout() {
        let invocation = compiled(&port_scan("1-65535"), true, &[]);
        assert_eq!(invocation.timeout, Duration::from_secs(3600));
        assert!(invocation.args.contains(&"3600s".to_string()));
    }

    #[test]
    fn raw_socket_scans_fail_without_elevation() {
        assert_eq!(
            compile(&port_scan("80"), "t", &policy(false), &[]),
            Err(CompileError::ElevationRequired(ActionId::PortScan))
        );
        let detect = action(ActionKind::ServiceDetect {
            scope: ServiceScope::All,
        });
        assert_eq!(
            compile(&detect, "t", &policy(false), &[OpenPort::tcp(22)]),
            Err(CompileError::ElevationRequired(ActionId::ServiceDetect))
        );
    }

    #[test]
    fn service_detect_all_uses_known_ports_or_full_range() {
        let detect = action(ActionKind::ServiceDetect {
            scope: ServiceScope::All,
        });
        let known = [OpenPort::tcp(22), OpenPort::tcp(3306), OpenPort::new(22, Protocol::Udp)];
        let invocation = compiled(&detect, true, &known);
        assert_eq!(
            invocation.command_line(),
            "sudo -n nmap -sS -sV -p 22,3306 -T4 -vv --host-timeout 300s -oX - 10.0.0.5"
        );

        let invocation = compiled(&detect, true, &[]);
        assert!(invocation.command_line().contains("-p 1-65535"));
        assert_eq!(invocation.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn service_detect_common_intersects_or_falls_back() {
        let detect = action(ActionKind::ServiceDetect {
            scope: ServiceScope::Common,
        });
        let known = [OpenPort::tcp(22), OpenPort::tcp(443), OpenPort::tcp(3306)];
        let invocation = compiled(&detect, true, &known);
        assert_eq!(invocation.action, ActionId::ServiceDetectCommon);
        assert!(invocation.command_line().contains("-p 22,443 "));

        let invocation = compiled(&detect, true, &[OpenPort::tcp(3306)]);
        assert!(invocation.command_line().contains("-p 3306 "));
    }

    #[test]
    fn fingerprint_uses_few_open_ports_plus_a_closed_one() {
        let fingerprint = action(ActionKind::OsFingerprint);
        let known = [
            OpenPort::tcp(22),
            OpenPort::tcp(80),
            OpenPort::tcp(443),
            OpenPort::tcp(8080),
        ];
        let invocation = compiled(&fingerprint, true, &known);
        assert_eq!(
            invocation.command_line(),
            "sudo -n nmap -O -p 22,80,443,1 -vv --host-timeout 300s -oX - 10.0.0.5"
        );

        let invocation = compiled(&fingerprint, false, &[]);
        assert!(!invocation.elevated);
        assert_eq!(
            invocation.command_line(),
            "nmap -O -vv --host-timeout 300s -oX - 10.0.0.5"
        );
    }

    #[test]
    fn fingerprint_closed_port_skips_known_open_ports() {
        let fingerprint = action(ActionKind::OsFingerprint);
        let known = [OpenPort::tcp(1), OpenPort::tcp(2), OpenPort::tcp(22)];
        let invocation = compiled(&fingerprint, true, &known);
        assert_eq!(
            invocation.command_line(),
            "sudo -n nmap -O -p 1,2,22,3 -vv --host-timeout 300s -oX - 10.0.0.5"
        );

        // Port 2 is past the fingerprint cut but still known open.
        let known = [
            OpenPort::tcp(1),
            OpenPort::tcp(22),
            OpenPort::tcp(80),
            OpenPort::tcp(2),
        ];
        let invocation = compiled(&fingerprint, true, &known);
        assert!(invocation.args.iter().any(|arg| arg == "1,22,80,3"));
    }

    #[test]
    fn argv_keeps_target_as_single_trailing_argument() {
        let invocation = compiled(&port_scan("22,80"), true, &[]);
        assert_eq!(invocation.args.last().map(String::as_str), Some("10.0.0.5"));
        assert!(!invocation.args.iter().any(|arg| arg.starts_with("--script")));
    }
}
