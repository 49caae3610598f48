//! Test-only scripted oracle and scanner plus scanner XML fixtures.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::budget::Budgets;
use crate::core::compiler::{Invocation, ScanPolicy};
use crate::io::engine::{ScanOutput, Scanner};
use crate::io::oracle::DecisionOracle;
use crate::io::process::ExitOutcome;
use crate::orchestrator::LoopSettings;

/// Loop settings matching the default config, without cooling.
pub fn settings() -> LoopSettings {
    LoopSettings {
        policy: ScanPolicy {
            program: "nmap".to_string(),
            elevation_enabled: true,
            scan_timeout: Duration::from_secs(300),
            full_range_timeout: Duration::from_secs(3600),
        },
        budgets: Budgets {
            max_iterations: 30,
            max_invocations: 25,
            max_elapsed: Duration::from_secs(3600),
        },
        cooling: None,
        dry_run: false,
    }
}

/// Oracle that replays a fixed script; `Err` entries simulate transport failures.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Script of successful replies only.
    pub fn replies<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `(system, user)` prompts received so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DecisionOracle for ScriptedOracle {
    fn propose(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((system_prompt.to_string(), user_prompt.to_string()));
        match self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("oracle script exhausted")),
        }
    }
}

/// Scanner that returns canned XML in order and records invocations.
pub struct ScriptedScanner {
    outputs: Mutex<VecDeque<String>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedScanner {
    pub fn new(outputs: impl IntoIterator<Item = String>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().collect()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Scanner for runs that must never execute anything.
    pub fn unused() -> Self {
        Self::new(Vec::new())
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Scanner for ScriptedScanner {
    fn execute(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ScanOutput> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        let xml = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("scanner script exhausted"))?;
        let line = format!("Starting {}", invocation.action);
        on_line(&line);
        Ok(ScanOutput {
            xml,
            diagnostics: format!("{line}\n"),
            exit: ExitOutcome {
                code: Some(0),
                timed_out: false,
            },
        })
    }
}

fn port_elements(ports: &[(u16, &str)], service: Option<(&str, &str, &str)>) -> String {
    ports
        .iter()
        .map(|(port, state)| {
            let service = service
                .map(|(name, product, version)| {
                    format!(r#"<service name="{name}" product="{product}" version="{version}"/>"#)
                })
                .unwrap_or_default();
            format!(
                r#"<port protocol="tcp" portid="{port}"><state state="{state}"/>{service}</port>"#
            )
        })
        .collect()
}

/// Single-host document with `status` and `(port, state)` TCP ports.
pub fn host_xml(status: &str, ports: &[(u16, &str)]) -> String {
    format!(
        r#"<?xml version="1.0"?><nmaprun><host><status state="{status}"/><address addr="10.0.0.5" addrtype="ipv4"/><ports>{}</ports></host></nmaprun>"#,
        port_elements(ports, None)
    )
}

/// Single-host document where every port carries the same service record.
pub fn service_xml(ports: &[(u16, &str)], service: (&str, &str, &str)) -> String {
    format!(
        r#"<nmaprun><host><status state="up"/><address addr="10.0.0.5" addrtype="ipv4"/><ports>{}</ports></host></nmaprun>"#,
        port_elements(ports, Some(service))
    )
}

/// Single-host document with `(name, accuracy)` OS candidates.
pub fn os_xml(matches: &[(&str, u8)]) -> String {
    let matches: String = matches
        .iter()
        .map(|(name, accuracy)| format!(r#"<osmatch name="{name}" accuracy="{accuracy}"/>"#))
        .collect();
    format!(
        r#"<nmaprun><host><status state="up"/><address addr="10.0.0.5" addrtype="ipv4"/><os>{matches}</os></host></nmaprun>"#
    )
}
