//! The scan loop: ask the oracle, validate, compile, execute, fold, repeat.
//!
//! One iteration is strictly ordered (oracle call, validation, execution) and
//! the loop runs on whatever thread calls [`run_scan`]. Progress is published
//! through the [`SessionHandle`] after each completed state application.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetExhausted, Budgets};
use crate::core::compiler::{ScanPolicy, compile};
use crate::core::goal::{Goal, is_goal_achieved};
use crate::core::intent::Intent;
use crate::core::state::ScanState;
use crate::core::target::validate_target;
use crate::core::types::ActionId;
use crate::core::validator::validate;
use crate::io::config::ScoutConfig;
use crate::io::engine::Scanner;
use crate::io::oracle::DecisionOracle;
use crate::io::preflight::check_policy;
use crate::io::process::ExitOutcome;
use crate::io::prompt::PromptEngine;
use crate::report::{RunStatus, StageRecord, result_summary};
use crate::session::SessionHandle;

/// Consecutive rejected replies that abort the run.
pub const MAX_CONSECUTIVE_REJECTIONS: u32 = 5;

/// Stage output recorded for actions skipped in dry runs.
pub const DRY_RUN_OUTPUT: &str = "(dry run)";

/// Normal termination reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinishReason {
    GoalAchieved,
    /// The oracle replied `done`.
    OracleDone { reason: Option<String> },
    Budget { exhausted: BudgetExhausted },
}

/// Abnormal termination reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    ConsecutiveRejections { count: u32 },
    StopRequested,
}

/// Reason why `run_scan` stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum LoopStop {
    Finished(FinishReason),
    Aborted(AbortReason),
}

impl LoopStop {
    pub fn status(&self) -> RunStatus {
        match self {
            LoopStop::Finished(_) => RunStatus::Finished,
            LoopStop::Aborted(_) => RunStatus::Aborted,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LoopStop::Finished(FinishReason::GoalAchieved) => "goal achieved".to_string(),
            LoopStop::Finished(FinishReason::OracleDone { reason: Some(reason) }) => {
                format!("done: {reason}")
            }
            LoopStop::Finished(FinishReason::OracleDone { reason: None }) => "done".to_string(),
            LoopStop::Finished(FinishReason::Budget { exhausted }) => exhausted.as_str().to_string(),
            LoopStop::Aborted(AbortReason::ConsecutiveRejections { count }) => {
                format!("{count} consecutive invalid intents")
            }
            LoopStop::Aborted(AbortReason::StopRequested) => "stop requested".to_string(),
        }
    }
}

/// Summary of a scan loop invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub stop: LoopStop,
    pub state: ScanState,
}

/// Loop settings resolved from config.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub policy: ScanPolicy,
    pub budgets: Budgets,
    pub cooling: Option<Duration>,
    pub dry_run: bool,
}

impl LoopSettings {
    pub fn from_config(config: &ScoutConfig) -> Self {
        Self {
            policy: config.scan_policy(),
            budgets: config.budgets(),
            cooling: config.cooling(),
            dry_run: config.scanner.dry_run,
        }
    }
}

/// Run the loop for `session` and record its terminal status.
///
/// Errors (invalid target, policy violation, prompt rendering) mark the
/// session failed and are returned; they happen before any invocation.
pub fn run_scan<O: DecisionOracle, S: Scanner>(
    session: &SessionHandle,
    settings: &LoopSettings,
    oracle: &O,
    scanner: &S,
) -> Result<LoopOutcome> {
    match scan_loop(session, settings, oracle, scanner) {
        Ok(outcome) => {
            let reason = outcome.stop.describe();
            info!(iterations = outcome.iterations, reason = %reason, "scan loop stopped");
            session.log(outcome.iterations, &format!("Stopped: {reason}"));
            session.complete(outcome.stop.status(), Some(reason), None);
            Ok(outcome)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "scan failed");
            session.complete(RunStatus::Failed, None, Some(format!("{err:#}")));
            Err(err)
        }
    }
}

#[instrument(skip_all, fields(session = %session.id(), goal = session.goal().id))]
fn scan_loop<O: DecisionOracle, S: Scanner>(
    session: &SessionHandle,
    settings: &LoopSettings,
    oracle: &O,
    scanner: &S,
) -> Result<LoopOutcome> {
    let target = validate_target(session.target()).context("invalid target")?;
    check_policy(&settings.policy)?;
    let goal: &Goal = session.goal();
    let prompts = PromptEngine::new();
    let system_prompt = prompts.render_system(goal).context("render system prompt")?;

    let started = Instant::now();
    let mut state = ScanState::new(target.clone());
    let mut iteration = 0u32;
    let mut rejections = 0u32;
    let mut last_plan: Option<String> = None;

    let stop = loop {
        if session.stop_requested() {
            break LoopStop::Aborted(AbortReason::StopRequested);
        }
        if is_goal_achieved(&state, goal) {
            break LoopStop::Finished(FinishReason::GoalAchieved);
        }
        let next = iteration + 1;
        if let Some(exhausted) = settings
            .budgets
            .check(next, state.invocation_count, started.elapsed())
        {
            break LoopStop::Finished(FinishReason::Budget { exhausted });
        }
        iteration = next;

        session.update(|progress| {
            progress.iteration = iteration;
            progress.message = Some("Asking oracle".to_string());
        });
        let user_prompt = prompts
            .render_user(&state, last_plan.as_deref())
            .context("render user prompt")?;
        let reply = match oracle.propose(&system_prompt, &user_prompt) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(iteration, err = %format!("{err:#}"), "oracle call failed");
                session.log(iteration, &format!("Oracle error: {err:#}"));
                continue;
            }
        };

        let action = match validate(&reply, &state, goal) {
            Ok(action) => action,
            Err(rejection) => {
                rejections += 1;
                debug!(iteration, rejections, %rejection, "reply rejected");
                session.log(
                    iteration,
                    &format!("Rejected: {rejection} (reply: {})", preview(&reply)),
                );
                if rejections >= MAX_CONSECUTIVE_REJECTIONS {
                    break LoopStop::Aborted(AbortReason::ConsecutiveRejections {
                        count: rejections,
                    });
                }
                continue;
            }
        };
        rejections = 0;

        let id = action.id();
        log_intent(session, iteration, id, &action.intent);
        if let Some(plan) = action.intent.plan.as_deref().map(str::trim)
            && !plan.is_empty()
        {
            last_plan = Some(plan.to_string());
        }
        if action.is_done() {
            session.update(|progress| progress.last_action = Some(id));
            break LoopStop::Finished(FinishReason::OracleDone {
                reason: non_empty(action.intent.reason.as_deref()),
            });
        }

        let invocation = compile(&action, &target, &settings.policy, &state.open_ports)
            .context("compile invocation")?
            .ok_or_else(|| anyhow!("{id} compiled to no invocation"))?;
        let command = invocation.command_line();
        let started_at = Local::now();

        if settings.dry_run {
            state.record_skipped(id);
            session.log(iteration, &format!("{id} skipped (dry run): {command}"));
            let stage = StageRecord {
                action: id,
                label: id.label(),
                command: None,
                output: DRY_RUN_OUTPUT.to_string(),
                started_at,
                exit_code: None,
                timed_out: false,
            };
            publish(session, iteration, id, &state, stage);
            continue;
        }

        session.log(iteration, &format!("{id} started: {command}"));
        session.update(|progress| {
            progress.last_action = Some(id);
            progress.current_command = Some(command.clone());
            progress.message = Some(running_message(id, &action.intent));
        });

        let (result, diagnostics, exit) =
            match scanner.execute(&invocation, &mut |line| session.output_line(line)) {
                Ok(output) => (output.parse(), output.diagnostics, output.exit),
                Err(err) => {
                    warn!(iteration, action = %id, err = %format!("{err:#}"), "scanner failed");
                    session.log(iteration, &format!("{id} failed: {err:#}"));
                    (None, String::new(), ExitOutcome::default())
                }
            };
        if result.is_none() {
            debug!(iteration, action = %id, "no structured data");
        }
        state.record_invocation(id, result.as_ref());

        let output = match diagnostics.trim() {
            "" => result_summary(id, result.as_ref()),
            text => text.to_string(),
        };
        session.log(
            iteration,
            &format!("{id} done (exit {:?}, {} chars)", exit.code, output.len()),
        );
        let stage = StageRecord {
            action: id,
            label: id.label(),
            command: Some(command),
            output,
            started_at,
            exit_code: exit.code,
            timed_out: exit.timed_out,
        };
        publish(session, iteration, id, &state, stage);

        if let Some(cooling) = settings.cooling {
            thread::sleep(cooling);
        }
    };

    Ok(LoopOutcome {
        iterations: iteration,
        stop,
        state,
    })
}

fn publish(
    session: &SessionHandle,
    iteration: u32,
    id: ActionId,
    state: &ScanState,
    stage: StageRecord,
) {
    session.update(|progress| {
        progress.iteration = iteration;
        progress.state = state.clone();
        progress.last_action = Some(id);
        progress.stages.push(stage);
        progress.current_command = None;
        progress.message = Some(format!("Ran: {id}"));
    });
}

fn log_intent(session: &SessionHandle, iteration: u32, id: ActionId, intent: &Intent) {
    let mut line = format!("Intent: {}", intent.kind.as_str());
    if !intent.params.is_empty()
        && let Ok(params) = serde_json::to_string(&intent.params)
    {
        line.push_str(&format!(" params: {params}"));
    }
    line.push_str(&format!(" -> action: {id}"));
    session.log(iteration, &line);
    if let Some(reasoning) = non_empty(intent.reasoning.as_deref()) {
        session.log(iteration, &format!("reasoning: {reasoning}"));
    }
    if let Some(plan) = non_empty(intent.plan.as_deref()) {
        session.log(iteration, &format!("plan: {plan}"));
    }
}

fn running_message(id: ActionId, intent: &Intent) -> String {
    let mut message = format!("Running: {id}");
    if let Some(reason) = non_empty(intent.reason.as_deref()) {
        message.push_str(&format!(" Reason: {reason}"));
    }
    message
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn preview(reply: &str) -> String {
    const LIMIT: usize = 80;
    let trimmed = reply.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((end, _)) => format!("{}...", &trimmed[..end]),
        None => format!("{trimmed:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::goal::goal_by_id;
    use crate::core::types::{OpenPort, Reachability};
    use crate::session::{ScanEvent, SessionHandle};
    use crate::test_support::{ScriptedOracle, ScriptedScanner, host_xml, settings};

    fn session(goal: &str) -> (SessionHandle, std::sync::mpsc::Receiver<ScanEvent>) {
        SessionHandle::new("test", "10.0.0.5", goal_by_id(goal).expect("goal"), 30)
    }

    #[test]
    fn simple_recon_runs_to_goal() {
        let (session, _rx) = session("simple_recon");
        let oracle = ScriptedOracle::replies([
            r#"{"intent": "host_reachability", "reason": "check"}"#,
            r#"{"intent": "port_scan", "params": {"range": "1-1024"}}"#,
            r#"{"intent": "service_detect", "params": {"scope": "all"}}"#,
            r#"{"intent": "os_fingerprint"}"#,
        ]);
        let scanner = ScriptedScanner::new([
            host_xml("up", &[]),
            host_xml("up", &[(22, "open"), (80, "open")]),
            host_xml("up", &[(22, "open"), (80, "open")]),
            host_xml("up", &[]),
        ]);

        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(outcome.stop, LoopStop::Finished(FinishReason::GoalAchieved));
        assert_eq!(outcome.state.reachability, Reachability::Up);
        assert_eq!(
            outcome.state.open_ports,
            vec![OpenPort::tcp(22), OpenPort::tcp(80)]
        );
        assert_eq!(outcome.state.invocation_count, 4);
        assert_eq!(outcome.iterations, 4);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, RunStatus::Finished);
        assert_eq!(snapshot.stages.len(), 4);
        assert_eq!(
            scanner.invocations()[1].command_line(),
            "sudo -n nmap -sS -p 1-1024 -T4 -vv --host-timeout 300s -oX - 10.0.0.5"
        );
    }

    #[test]
    fn five_rejections_abort_before_iteration_budget() {
        let (session, _rx) = session("simple_recon");
        let oracle = ScriptedOracle::replies([
            "I think we should scan everything",
            r#"{"intent": "port_scan", "params": {"range": "22;rm -rf /"}}"#,
            r#"{"intent": "vuln_scan"}"#,
            r#"{"a": 1} {"b": 2}"#,
            r#"{"intent": "port_scan"}"#,
        ]);
        let scanner = ScriptedScanner::unused();

        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(
            outcome.stop,
            LoopStop::Aborted(AbortReason::ConsecutiveRejections { count: 5 })
        );
        assert_eq!(outcome.iterations, 5);
        assert!(scanner.invocations().is_empty());
        assert_eq!(session.snapshot().status, RunStatus::Aborted);
    }

    #[test]
    fn rejections_below_threshold_keep_going() {
        let (session, _rx) = session("full_stealth_tcp");
        let oracle = ScriptedOracle::replies([
            "nope",
            "nope",
            "nope",
            "nope",
            r#"{"intent": "port_scan", "params": {"range": "1-1024"}}"#,
        ]);
        let scanner = ScriptedScanner::new([host_xml("up", &[(443, "open")])]);
        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(outcome.stop, LoopStop::Finished(FinishReason::GoalAchieved));
    }

    #[test]
    fn oracle_errors_do_not_count_as_rejections() {
        let (session, _rx) = session("full_stealth_tcp");
        let oracle = ScriptedOracle::new(vec![
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Ok(r#"{"intent": "port_scan", "params": {"range": "80"}}"#.to_string()),
        ]);
        let scanner = ScriptedScanner::new([host_xml("up", &[(80, "open")])]);
        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(outcome.stop, LoopStop::Finished(FinishReason::GoalAchieved));
        assert_eq!(outcome.state.invocation_count, 1);
    }

    #[test]
    fn oracle_done_finishes_with_reason() {
        let (session, _rx) = session("simple_recon");
        let oracle =
            ScriptedOracle::replies([r#"{"intent": "finish", "reason": "host is out of scope"}"#]);
        let scanner = ScriptedScanner::unused();
        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(
            outcome.stop,
            LoopStop::Finished(FinishReason::OracleDone {
                reason: Some("host is out of scope".to_string())
            })
        );
        assert!(outcome.state.actions_run.is_empty());
    }

    #[test]
    fn execution_failure_still_records_action() {
        let (session, _rx) = session("simple_recon");
        let oracle = ScriptedOracle::replies([r#"{"intent": "host_check"}"#]);
        let scanner = ScriptedScanner::new(["<nmaprun><host>".to_string()]);
        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        // Malformed discovery output means no response, which achieves a full goal.
        assert_eq!(outcome.state.reachability, Reachability::NoResponse);
        assert_eq!(outcome.state.actions_run, vec![ActionId::HostReachability]);
        assert_eq!(outcome.stop, LoopStop::Finished(FinishReason::GoalAchieved));
    }

    #[test]
    fn stop_request_aborts_before_next_iteration() {
        let (session, _rx) = session("simple_recon");
        session.request_stop();
        let oracle = ScriptedOracle::new(Vec::new());
        let scanner = ScriptedScanner::unused();
        let outcome = run_scan(&session, &settings(), &oracle, &scanner).expect("run");
        assert_eq!(outcome.stop, LoopStop::Aborted(AbortReason::StopRequested));
        assert_eq!(
            session.snapshot().stop_reason.as_deref(),
            Some("stop requested")
        );
    }

    #[test]
    fn invalid_target_fails_before_any_call() {
        let (session, _rx) =
            SessionHandle::new("test", "10.0.0.1;id", goal_by_id("simple_recon").expect("goal"), 30);
        let oracle = ScriptedOracle::new(Vec::new());
        let scanner = ScriptedScanner::unused();
        let err = run_scan(&session, &settings(), &oracle, &scanner).unwrap_err();
        assert!(err.to_string().contains("invalid target"));
        assert_eq!(oracle.calls(), 0);
        assert_eq!(session.snapshot().status, RunStatus::Failed);
    }

    #[test]
    fn preview_truncates_long_replies() {
        let long = "x".repeat(100);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(80)));
        assert_eq!(preview("short"), "\"short\"");
    }
}
