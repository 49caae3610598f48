//! Textual state block handed to the decision oracle.

use std::fmt::Write;

use crate::core::goal::goal_progress;
use crate::core::state::ScanState;

/// Render the current scan facts, goal progress and the oracle's last plan.
pub fn state_summary(state: &ScanState, last_plan: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Target: {}", state.target());
    let _ = writeln!(out, "Host reachability: {}", state.reachability.as_str());
    if let Some(addr) = &state.host_address {
        let _ = writeln!(out, "Host address: {addr}");
    }
    if let Some(name) = &state.hostname {
        let _ = writeln!(out, "Hostname: {name}");
    }
    if state.open_ports.is_empty() {
        out.push_str("Open ports: none\n");
    } else {
        let ports: Vec<String> = state.open_ports.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "Open ports: {}", ports.join(", "));
    }
    for entry in &state.services {
        let service = entry.service.as_deref().unwrap_or("unknown");
        match &entry.version {
            Some(version) => {
                let _ = writeln!(
                    out,
                    "  {}/{}: {service} {version}",
                    entry.port, entry.protocol
                );
            }
            None => {
                let _ = writeln!(out, "  {}/{}: {service}", entry.port, entry.protocol);
            }
        }
    }
    if let Some(guess) = &state.os_guess {
        let _ = writeln!(out, "OS guess: {} ({}%)", guess.name, guess.accuracy);
    }
    let progress = goal_progress(state);
    let _ = writeln!(
        out,
        "Goal progress: host_known={} ports_known={} services_known={} os_known={}",
        progress.host_known, progress.ports_known, progress.services_known, progress.os_known
    );
    let actions: Vec<&str> = state.actions_run.iter().map(|a| a.as_str()).collect();
    let _ = write!(out, "Scans run: {}", actions.join(", "));
    if let Some(plan) = last_plan.map(str::trim).filter(|plan| !plan.is_empty()) {
        let _ = write!(out, "\nYour previous plan: {plan}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ServiceEntry;
    use crate::core::types::{ActionId, OpenPort, Protocol, Reachability};

    #[test]
    fn renders_empty_state() {
        let state = ScanState::new("scanme.example");
        let text = state_summary(&state, None);
        assert_eq!(
            text,
            "Target: scanme.example\n\
             Host reachability: unknown\n\
             Open ports: none\n\
             Goal progress: host_known=false ports_known=false services_known=false os_known=false\n\
             Scans run: "
        );
    }

    #[test]
    fn renders_ports_services_and_plan() {
        let mut state = ScanState::new("10.0.0.5");
        state.reachability = Reachability::Up;
        state.open_ports = vec![OpenPort::tcp(22), OpenPort::tcp(80)];
        state.services.push(ServiceEntry {
            port: 22,
            protocol: Protocol::Tcp,
            service: Some("ssh".to_string()),
            version: Some("OpenSSH 8.9p1".to_string()),
        });
        state.actions_run = vec![ActionId::PortScan, ActionId::ServiceDetect];

        let text = state_summary(&state, Some("fingerprint next"));
        assert!(text.contains("Open ports: 22/tcp, 80/tcp\n"));
        assert!(text.contains("  22/tcp: ssh OpenSSH 8.9p1\n"));
        assert!(text.contains("host_known=true ports_known=true services_known=true os_known=false"));
        assert!(text.contains("Scans run: port_scan, service_detect"));
        assert!(text.ends_with("Your previous plan: fingerprint next"));
    }
}
