//! Intent validation: untrusted oracle text in, allow-listed action out.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. exactly one JSON object can be extracted from the reply;
//! 2. once the goal is achieved, only `done` is accepted;
//! 3. the declared kind is recognized (and the object matches the schema);
//! 4. per-kind rules against the current state and goal.
//!
//! Validation is pure. Counting consecutive rejections is the caller's job.

use serde::Serialize;
use thiserror::Error;

use crate::core::goal::{Goal, is_goal_achieved};
use crate::core::intent::{Intent, IntentKind, declared_kind, extract_object, parse_intent};
use crate::core::port_range::{PortRange, PortRangeError};
use crate::core::state::ScanState;
use crate::core::types::{ActionId, COMMON_PORTS, ServiceScope};

/// Why an oracle reply was not turned into an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("no JSON object found in reply")]
    NoObject,
    #[error("reply contains {0} JSON objects; expected exactly one")]
    Ambiguous(usize),
    #[error("malformed intent: {0}")]
    Malformed(String),
    #[error("intent is missing a kind")]
    MissingKind,
    #[error("goal already achieved; only done is accepted (got {0:?})")]
    GoalAlreadyAchieved(String),
    #[error("unknown intent kind {0:?}")]
    UnknownKind(String),
    #[error("intent does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("goal {0} does not allow host discovery")]
    HostDiscoveryForbidden(&'static str),
    #[error("port_scan requires a range parameter")]
    MissingPortRange,
    #[error("invalid port range: {0}")]
    InvalidPortRange(#[from] PortRangeError),
    #[error("service_detect requires at least one discovered open port")]
    NoOpenPorts,
    #[error("invalid service_detect scope {0:?}; expected all or common")]
    InvalidScope(String),
    #[error("scope common requires an open port among 22, 80, 443, 8080, 8443")]
    NoCommonPorts,
}

/// Validated, normalized action derived from one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    HostReachability,
    PortScan { range: PortRange },
    ServiceDetect { scope: ServiceScope },
    OsFingerprint,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    /// The intent that produced this action, kept for logging.
    pub intent: Intent,
}

impl Action {
    pub fn id(&self) -> ActionId {
        match &self.kind {
            ActionKind::HostReachability => ActionId::HostReachability,
            ActionKind::PortScan { .. } => ActionId::PortScan,
            ActionKind::ServiceDetect {
                scope: ServiceScope::All,
            } => ActionId::ServiceDetect,
            ActionKind::ServiceDetect {
                scope: ServiceScope::Common,
            } => ActionId::ServiceDetectCommon,
            ActionKind::OsFingerprint => ActionId::OsFingerprint,
            ActionKind::Done => ActionId::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, ActionKind::Done)
    }
}

/// Turn an oracle reply into an action, or reject it.
pub fn validate(reply: &str, state: &ScanState, goal: &Goal) -> Result<Action, Rejection> {
    let object = extract_object(reply)?;
    let declared = declared_kind(&object)
        .filter(|kind| !kind.is_empty())
        .ok_or(Rejection::MissingKind)?
        .to_string();
    let kind = IntentKind::parse(&declared);

    if is_goal_achieved(state, goal) && kind != Some(IntentKind::Done) {
        return Err(Rejection::GoalAlreadyAchieved(declared));
    }
    if kind.is_none() {
        return Err(Rejection::UnknownKind(declared));
    }

    let intent = parse_intent(object)?;
    let kind = match intent.kind {
        IntentKind::HostReachability => {
            if !goal.allows_host_discovery {
                return Err(Rejection::HostDiscoveryForbidden(goal.id));
            }
            ActionKind::HostReachability
        }
        IntentKind::PortScan => {
            let raw = intent
                .params
                .range
                .as_deref()
                .ok_or(Rejection::MissingPortRange)?;
            ActionKind::PortScan {
                range: PortRange::parse(raw)?,
            }
        }
        IntentKind::ServiceDetect => {
            if state.open_ports.is_empty() {
                return Err(Rejection::NoOpenPorts);
            }
            let scope = match intent.params.scope.as_deref() {
                None => ServiceScope::All,
                Some(raw) => ServiceScope::parse(raw)
                    .ok_or_else(|| Rejection::InvalidScope(raw.to_string()))?,
            };
            if scope == ServiceScope::Common
                && !state
                    .open_ports
                    .iter()
                    .any(|open| COMMON_PORTS.contains(&open.port))
            {
                return Err(Rejection::NoCommonPorts);
            }
            ActionKind::ServiceDetect { scope }
        }
        IntentKind::OsFingerprint => ActionKind::OsFingerprint,
        IntentKind::Done => ActionKind::Done,
    };
    Ok(Action { kind, intent })
}
