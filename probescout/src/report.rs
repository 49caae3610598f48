//! Stage history, result snapshots and the plain-text scan report.

use std::fmt::Write;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::core::nmap_xml::ScanResult;
use crate::core::state::ScanState;
use crate::core::types::{ActionId, Reachability};

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Aborted,
    /// Stopped by an error (pre-flight, config, prompt rendering).
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

/// One executed (or dry-run) action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub action: ActionId,
    pub label: &'static str,
    /// Command line as run, absent in dry runs.
    pub command: Option<String>,
    /// Human-readable output: scanner diagnostics, else a summary of the parsed result.
    pub output: String,
    pub started_at: DateTime<Local>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Serializable result snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub id: String,
    pub target: String,
    pub goal: &'static str,
    pub goal_label: &'static str,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Local>,
    pub elapsed_secs: u64,
    pub last_action: Option<ActionId>,
    pub current_command: Option<String>,
    pub message: Option<String>,
    pub state: ScanState,
    pub stages: Vec<StageRecord>,
    pub log: Vec<String>,
}

/// Stage output used when the scanner printed nothing human-readable.
pub fn result_summary(action: ActionId, result: Option<&ScanResult>) -> String {
    let Some(host) = result.and_then(ScanResult::first_host) else {
        return format!("{}: no data", action.label());
    };
    let mut out = String::new();
    let address = host.address.as_deref().unwrap_or("unknown address");
    let reachability = match host.reachability() {
        Reachability::Up => "up",
        _ => "no response",
    };
    let _ = write!(out, "Host {address} is {reachability}");
    if let Some(name) = &host.hostname {
        let _ = write!(out, " ({name})");
    }
    let mut open = host.open_ports().peekable();
    if open.peek().is_some() {
        out.push_str("\nOpen ports:");
        for port in open {
            let _ = write!(out, "\n  {}/{}", port.port, port.protocol);
            if let Some(service) = &port.service {
                if let Some(name) = &service.name {
                    let _ = write!(out, " {name}");
                }
                if let Some(product) = &service.product {
                    let _ = write!(out, " {product}");
                }
                if let Some(version) = &service.version {
                    let _ = write!(out, " {version}");
                }
            }
        }
    } else if action == ActionId::PortScan || action.is_service_detect() {
        out.push_str("\nOpen ports: none");
    }
    if let Some(os) = host.best_os_match() {
        let _ = write!(out, "\nOS match: {} ({}%)", os.name, os.accuracy);
    }
    out
}

fn format_elapsed(secs: u64) -> String {
    match (secs / 60, secs % 60) {
        (0, s) => format!("{s} s"),
        (m, 0) => format!("{m} m"),
        (m, s) => format!("{m} m {s} s"),
    }
}

fn results_section(summary: &ScanSummary) -> String {
    let state = &summary.state;
    let mut out = String::new();
    let host = state
        .host_address
        .as_deref()
        .or(state.hostname.as_deref())
        .unwrap_or("-");
    let _ = writeln!(out, "Target:         {}", summary.target);
    let _ = writeln!(out, "Host:           {host}");
    if let Some(name) = &state.hostname
        && state.host_address.as_deref() != Some(name.as_str())
    {
        let _ = writeln!(out, "Hostname:       {name}");
    }
    let _ = writeln!(out, "Reachability:   {}", state.reachability.as_str());
    let _ = writeln!(
        out,
        "OS fingerprint: {}",
        if state.os_fingerprint_done { "done" } else { "-" }
    );
    if let Some(guess) = &state.os_guess {
        let _ = writeln!(out, "OS guess:       {} ({}%)", guess.name, guess.accuracy);
    }
    out.push_str("\nOpen ports:\n");
    if state.open_ports.is_empty() {
        out.push_str("  (none)\n");
    }
    for port in &state.open_ports {
        let _ = writeln!(out, "  {port}");
    }
    out.push_str("\nServices:\n");
    if state.services.is_empty() {
        out.push_str("  (none)\n");
    }
    for entry in &state.services {
        let service = entry.service.as_deref().unwrap_or("-");
        match &entry.version {
            Some(version) => {
                let _ = writeln!(out, "  {}/{}: {service} {version}", entry.port, entry.protocol);
            }
            None => {
                let _ = writeln!(out, "  {}/{}: {service}", entry.port, entry.protocol);
            }
        }
    }
    out
}

/// Render the plain-text report for a finished (or running) session.
pub fn render_report(summary: &ScanSummary) -> String {
    let mut out = String::new();
    out.push_str("1. Progress\n---\n");
    let _ = writeln!(out, "Target:     {}", summary.target);
    let _ = writeln!(out, "Goal:       {} [{}]", summary.goal_label, summary.goal);
    let _ = writeln!(out, "Status:     {}", summary.status.as_str());
    if let Some(reason) = &summary.stop_reason {
        let _ = writeln!(out, "Reason:     {reason}");
    }
    let _ = writeln!(
        out,
        "Steps:      {} / {}",
        summary.iteration, summary.max_iterations
    );
    let _ = writeln!(out, "Stages:     {}", summary.stages.len());
    let _ = writeln!(out, "Time taken: {}", format_elapsed(summary.elapsed_secs));
    if let Some(error) = &summary.error {
        let _ = writeln!(out, "Error:      {error}");
    }

    out.push_str("\n2. Stages\n---\n");
    if summary.stages.is_empty() {
        out.push_str("No stages.\n");
    }
    for stage in &summary.stages {
        let _ = writeln!(
            out,
            "{}  {} {}",
            stage.label,
            stage.action,
            stage.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(command) = &stage.command {
            let _ = writeln!(out, "  $ {command}");
        }
    }

    out.push_str("\n3. Output\n---\n");
    let outputs: Vec<&str> = summary
        .stages
        .iter()
        .map(|stage| stage.output.trim())
        .filter(|output| !output.is_empty())
        .collect();
    if outputs.is_empty() {
        out.push_str("-\n");
    } else {
        out.push_str(&outputs.join("\n"));
        out.push('\n');
    }

    out.push_str("\n4. Results\n---\n");
    out.push_str(&results_section(summary));

    out.push_str("\n5. Log\n---\n");
    if summary.log.is_empty() {
        out.push_str("-\n");
    }
    for line in &summary.log {
        out.push_str(line);
        out.push('\n');
    }
    out
}
