//! Oracle prompt rendering.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::goal::Goal;
use crate::core::intent::IntentKind;
use crate::core::state::ScanState;
use crate::core::summary::state_summary;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const USER_TEMPLATE: &str = include_str!("prompts/user.md");

/// Rendered prompt pair for one oracle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("user", USER_TEMPLATE)
            .expect("user template should be valid");
        Self { env }
    }

    /// System prompt: role, goal text and the reply format the goal allows.
    pub fn render_system(&self, goal: &Goal) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            goal => goal.text,
            intents => advertised_intents(goal),
        })?;
        Ok(rendered)
    }

    /// User prompt: current state block plus the reply instruction.
    pub fn render_user(&self, state: &ScanState, last_plan: Option<&str>) -> Result<String> {
        let template = self.env.get_template("user")?;
        let rendered = template.render(context! {
            state => state_summary(state, last_plan),
        })?;
        Ok(rendered)
    }

    pub fn render(&self, goal: &Goal, state: &ScanState, last_plan: Option<&str>) -> Result<Prompts> {
        Ok(Prompts {
            system: self.render_system(goal)?,
            user: self.render_user(state, last_plan)?,
        })
    }
}

/// Intent names offered to the oracle. Goals that skip host discovery never advertise it.
pub fn advertised_intents(goal: &Goal) -> Vec<&'static str> {
    let mut intents = Vec::new();
    if goal.allows_host_discovery {
        intents.push(IntentKind::HostReachability.as_str());
    }
    intents.extend([
        IntentKind::PortScan.as_str(),
        IntentKind::ServiceDetect.as_str(),
        IntentKind::OsFingerprint.as_str(),
        IntentKind::Done.as_str(),
    ]);
    intents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::goal::goal_by_id;

    #[test]
    fn system_prompt_carries_goal_and_intents() {
        let engine = PromptEngine::new();
        let goal = goal_by_id("simple_recon").expect("goal");
        let system = engine.render_system(goal).expect("render");
        assert!(system.contains(&format!("Goal: {}", goal.text)));
        assert!(system.contains(
            "\"intent\": one of host_reachability, port_scan, service_detect, os_fingerprint, done."
        ));
    }

    #[test]
    fn port_scan_goals_do_not_advertise_host_discovery() {
        let engine = PromptEngine::new();
        let goal = goal_by_id("web_ports").expect("goal");
        let system = engine.render_system(goal).expect("render");
        assert!(!system.contains("host_reachability"));
        assert_eq!(advertised_intents(goal)[0], "port_scan");
    }

    #[test]
    fn user_prompt_embeds_state_and_plan() {
        let engine = PromptEngine::new();
        let state = ScanState::new("10.0.0.5");
        let user = engine
            .render_user(&state, Some("scan the top ports"))
            .expect("render");
        assert!(user.starts_with("Target: 10.0.0.5\n"));
        assert!(user.contains("Your previous plan: scan the top ports"));
        assert!(user.ends_with("(JSON: intent, params as needed, reason; optional reasoning, plan)."));
    }
}
