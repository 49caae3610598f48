//! Goal catalog and the goal-achievement evaluator.
//!
//! A goal is a declarative stopping condition chosen before the run starts.
//! [`is_goal_achieved`] is pure and monotonic: it only reads the append-only
//! action history and the non-reverting reachability, so once it returns
//! `true` for a run it keeps returning `true`.

use serde::Serialize;

use crate::core::state::ScanState;
use crate::core::types::{ActionId, Reachability};

/// How a goal decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementMode {
    /// Host known, then ports, services and OS fingerprint (or the host did not respond).
    Full,
    /// At least one port scan.
    PortScanOnly,
    /// A port scan and a service detection (either scope).
    PortScanAndServices,
}

/// An immutable goal selected at scan start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Goal {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    /// Instruction text handed to the decision oracle.
    #[serde(skip)]
    pub text: &'static str,
    pub allows_host_discovery: bool,
    pub achievement_mode: AchievementMode,
}

/// Entry returned by [`list_goals`] for UIs and `probescout goals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalListing {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

const DEFAULT_GOAL_ID: &str = "simple_recon";

const GOALS: &[Goal] = &[
    Goal {
        id: "simple_recon",
        label: "Simple recon scan",
        description: "Host check, port scan, service detection, and OS fingerprint. You choose the steps.",
        text: "Do a simple recon on the target. You decide the steps and approach.",
        allows_host_discovery: true,
        achievement_mode: AchievementMode::Full,
    },
    Goal {
        id: "well_known_tcp",
        label: "Well known TCP scan",
        description: "Ports 1-1024 only, then service and OS detection. Skips host ping.",
        text: "Do a well-known TCP port scan on the target. Well-known typically means ports 1-1024. \
               Do not check host reachability; go straight to port_scan. You decide the steps and approach.",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::Full,
    },
    Goal {
        id: "full_stealth_tcp",
        label: "Full Stealth TCP scan on all ports",
        description: "All 65535 TCP ports (can take 45-60 min). Skips host ping. Stops after the port scan.",
        text: "Do a full stealth TCP scan on all ports. \
               Do not check host reachability; go straight to port_scan. You decide the steps and approach.",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::PortScanOnly,
    },
    Goal {
        id: "quick_top_ports",
        label: "Quick top ports",
        description: "Small set of high-value ports (22, 80, 443, 21, 25, 53, 8080, 8443, 3389). Under a minute.",
        text: "Scan only a small, fixed set of high-value ports (e.g. 22, 80, 443, 21, 25, 53, 8080, 8443, 3389). \
               Fast first look in under a minute; then optionally run service_detect. \
               Do not check host reachability; go straight to port_scan.",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::PortScanOnly,
    },
    Goal {
        id: "common_ports",
        label: "Common service ports",
        description: "FTP, SSH, SMTP, DNS, HTTP, POP3, IMAP, HTTPS, 8080, 8443 plus service/version detection.",
        text: "Scan common service ports (21, 22, 25, 53, 80, 110, 143, 443, 8080, 8443) and run service detection. \
               Do not check host reachability; go straight to port_scan, then run service_detect (scope all or common).",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::PortScanAndServices,
    },
    Goal {
        id: "web_ports",
        label: "Web server ports",
        description: "Ports 80, 443, 8080, 8443, 8000, 8888 plus service detection to identify the web stack.",
        text: "Scan web-related ports only (80, 443, 8080, 8443, 8000, 8888) and run service detection. \
               Identify the web stack and versions for follow-up HTTP(S) testing. \
               Do not check host reachability; go straight to port_scan on these ports, then service_detect.",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::PortScanAndServices,
    },
    Goal {
        id: "compliance_ports",
        label: "Policy / compliance ports",
        description: "Fixed policy set (22, 80, 443, 3389, 5985) plus version detection for baselines.",
        text: "Scan a fixed policy set (22, 80, 443, 3389, 5985) and run version detection. \
               Only these ports matter for the compliance baseline. \
               Do not check host reachability; go straight to port_scan, then service_detect.",
        allows_host_discovery: false,
        achievement_mode: AchievementMode::PortScanAndServices,
    },
    Goal {
        id: "external_perimeter",
        label: "External perimeter recon",
        description: "Host check, port scan, service detection, OS fingerprint. Full perimeter test.",
        text: "Simulate an external attacker: check host reachability, then port scan (well-known or top ports), \
               then service detection, then OS fingerprint. You decide the steps and approach.",
        allows_host_discovery: true,
        achievement_mode: AchievementMode::Full,
    },
];

/// Look up a goal by id.
pub fn goal_by_id(id: &str) -> Option<&'static Goal> {
    GOALS.iter().find(|goal| goal.id == id)
}

/// The goal used when none is selected.
pub fn default_goal() -> &'static Goal {
    goal_by_id(DEFAULT_GOAL_ID).unwrap_or(&GOALS[0])
}

pub fn list_goals() -> Vec<GoalListing> {
    GOALS
        .iter()
        .map(|goal| GoalListing {
            id: goal.id,
            label: goal.label,
            description: goal.description,
        })
        .collect()
}

/// Whether the goal's stopping condition holds for `state`.
pub fn is_goal_achieved(state: &ScanState, goal: &Goal) -> bool {
    let port_scanned = state.has_run(ActionId::PortScan);
    let services_detected = state.has_run_service_detect();
    match goal.achievement_mode {
        AchievementMode::PortScanOnly => port_scanned,
        AchievementMode::PortScanAndServices => port_scanned && services_detected,
        AchievementMode::Full => {
            let recon_complete = port_scanned && services_detected && state.os_fingerprint_done;
            if !goal.allows_host_discovery {
                return recon_complete;
            }
            match state.reachability {
                Reachability::Unknown => false,
                Reachability::NoResponse => true,
                Reachability::Up => recon_complete,
            }
        }
    }
}

/// Goal progress flags shown to the oracle and in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GoalProgress {
    pub host_known: bool,
    pub ports_known: bool,
    pub services_known: bool,
    pub os_known: bool,
}

pub fn goal_progress(state: &ScanState) -> GoalProgress {
    GoalProgress {
        host_known: state.reachability != Reachability::Unknown,
        ports_known: !state.open_ports.is_empty() || state.has_run(ActionId::PortScan),
        services_known: state.has_run_service_detect(),
        os_known: state.os_fingerprint_done,
    }
}
