//! Scan sessions: per-run shared progress, events and the session registry.
//!
//! The worker thread owns the loop and writes progress through a
//! [`SessionHandle`]; pollers read [`SessionHandle::snapshot`]. Every read and
//! write of the progress goes through one mutex per session, and readers only
//! hold it for the length of a clone. Events are pushed on an unbounded
//! `std::sync::mpsc` channel so the worker never blocks on a slow consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::core::goal::Goal;
use crate::core::state::ScanState;
use crate::core::types::ActionId;
use crate::report::{RunStatus, ScanSummary, StageRecord};

/// Worker-to-observer events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Progress after a state change: full state and stage history.
    Progress(ProgressUpdate),
    /// Timestamped execution log line.
    Log { line: String },
    /// Live scanner diagnostic line.
    Output { line: String },
    /// Terminal event; nothing follows it.
    Completed {
        status: RunStatus,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub iteration: u32,
    pub state: ScanState,
    pub last_action: Option<ActionId>,
    pub stages: Vec<StageRecord>,
    pub message: Option<String>,
    pub current_command: Option<String>,
}

/// Mutable progress fields shared between the worker and pollers.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub status: RunStatus,
    pub iteration: u32,
    pub state: ScanState,
    pub last_action: Option<ActionId>,
    pub stages: Vec<StageRecord>,
    pub log: Vec<String>,
    pub current_command: Option<String>,
    pub message: Option<String>,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
}

struct SessionInner {
    id: String,
    target: String,
    goal: &'static Goal,
    max_iterations: u32,
    started_at: DateTime<Local>,
    started: Instant,
    progress: Mutex<SessionProgress>,
    stop: AtomicBool,
    events: Sender<ScanEvent>,
}

/// Cheap, clonable handle to one scan session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Create a session and the receiving end of its event channel.
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        goal: &'static Goal,
        max_iterations: u32,
    ) -> (Self, Receiver<ScanEvent>) {
        let target = target.into();
        let (events, rx) = mpsc::channel();
        let progress = SessionProgress {
            status: RunStatus::Running,
            iteration: 0,
            state: ScanState::new(target.clone()),
            last_action: None,
            stages: Vec::new(),
            log: Vec::new(),
            current_command: None,
            message: None,
            stop_reason: None,
            error: None,
        };
        let inner = SessionInner {
            id: id.into(),
            target,
            goal,
            max_iterations,
            started_at: Local::now(),
            started: Instant::now(),
            progress: Mutex::new(progress),
            stop: AtomicBool::new(false),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn goal(&self) -> &'static Goal {
        self.inner.goal
    }

    fn lock(&self) -> MutexGuard<'_, SessionProgress> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ScanEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    /// Copy of the current progress.
    pub fn snapshot(&self) -> ScanSummary {
        let progress = self.lock().clone();
        ScanSummary {
            id: self.inner.id.clone(),
            target: self.inner.target.clone(),
            goal: self.inner.goal.id,
            goal_label: self.inner.goal.label,
            status: progress.status,
            stop_reason: progress.stop_reason,
            error: progress.error,
            iteration: progress.iteration,
            max_iterations: self.inner.max_iterations,
            started_at: self.inner.started_at,
            elapsed_secs: self.inner.started.elapsed().as_secs(),
            last_action: progress.last_action,
            current_command: progress.current_command,
            message: progress.message,
            state: progress.state,
            stages: progress.stages,
            log: progress.log,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    /// Ask the worker to stop before its next iteration.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Apply `f` under the session lock and publish the resulting progress.
    pub fn update(&self, f: impl FnOnce(&mut SessionProgress)) {
        let update = {
            let mut progress = self.lock();
            f(&mut progress);
            ProgressUpdate {
                iteration: progress.iteration,
                state: progress.state.clone(),
                last_action: progress.last_action,
                stages: progress.stages.clone(),
                message: progress.message.clone(),
                current_command: progress.current_command.clone(),
            }
        };
        self.emit(ScanEvent::Progress(update));
    }

    /// Append a timestamped log line: `[YYYY-MM-DD HH:MM:SS] [step N] text`.
    pub fn log(&self, iteration: u32, text: &str) {
        let line = format!(
            "[{}] [step {iteration}] {text}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.lock().log.push(line.clone());
        self.emit(ScanEvent::Log { line });
    }

    /// Forward one live scanner diagnostic line.
    pub fn output_line(&self, line: &str) {
        self.emit(ScanEvent::Output {
            line: line.to_string(),
        });
    }

    /// Move to a terminal status. Later calls are ignored.
    pub fn complete(&self, status: RunStatus, reason: Option<String>, error: Option<String>) {
        {
            let mut progress = self.lock();
            if progress.status.is_terminal() {
                return;
            }
            progress.status = status;
            progress.stop_reason = reason.clone();
            progress.error = error;
            progress.current_command = None;
        }
        self.emit(ScanEvent::Completed { status, reason });
    }
}

/// Short listing entry for `GET /api/scans`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionListing {
    pub id: String,
    pub target: String,
    pub goal: &'static str,
    pub status: RunStatus,
}

/// Finished sessions kept for polling before the oldest are dropped.
pub const DEFAULT_RETAINED_SESSIONS: usize = 100;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, SessionHandle>,
    /// Ids in creation order.
    order: VecDeque<String>,
}

/// Sessions by id. Running sessions are always kept; beyond `retain` finished
/// ones, the oldest finished session is evicted when a new one is created.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    retain: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            retain,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session under a fresh id.
    pub fn create(
        &self,
        target: impl Into<String>,
        goal: &'static Goal,
        max_iterations: u32,
    ) -> (SessionHandle, Receiver<ScanEvent>) {
        let id = Uuid::new_v4().to_string();
        let (handle, rx) = SessionHandle::new(id.clone(), target, goal, max_iterations);
        let mut inner = self.lock();
        evict_finished(&mut inner, self.retain);
        inner.by_id.insert(id.clone(), handle.clone());
        inner.order.push_back(id);
        (handle, rx)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.lock().by_id.get(id).cloned()
    }

    /// Sessions in creation order.
    pub fn list(&self) -> Vec<SessionListing> {
        let handles: Vec<SessionHandle> = {
            let inner = self.lock();
            inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id).cloned())
                .collect()
        };
        handles
            .into_iter()
            .map(|handle| SessionListing {
                id: handle.id().to_string(),
                target: handle.target().to_string(),
                goal: handle.goal().id,
                status: handle.status(),
            })
            .collect()
    }
}

fn evict_finished(inner: &mut RegistryInner, retain: usize) {
    let finished: Vec<String> = inner
        .order
        .iter()
        .filter(|id| {
            inner
                .by_id
                .get(*id)
                .is_some_and(|handle| handle.status().is_terminal())
        })
        .cloned()
        .collect();
    // Make room for one more under the limit.
    let excess = (finished.len() + 1).saturating_sub(retain.max(1));
    for id in finished.into_iter().take(excess) {
        debug!(session = %id, "evicting finished session");
        inner.by_id.remove(&id);
        inner.order.retain(|other| *other != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::goal::default_goal;
    use crate::core::types::OpenPort;

    #[test]
    fn update_publishes_progress_event_and_snapshot() {
        let (session, rx) = SessionHandle::new("s1", "10.0.0.5", default_goal(), 30);
        session.update(|progress| {
            progress.iteration = 2;
            progress.state.open_ports.push(OpenPort::tcp(80));
            progress.last_action = Some(ActionId::PortScan);
        });

        match rx.try_recv().expect("event") {
            ScanEvent::Progress(update) => {
                assert_eq!(update.iteration, 2);
                assert_eq!(update.state.open_ports, vec![OpenPort::tcp(80)]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let snapshot = session.snapshot();
        assert_eq!(snapshot.iteration, 2);
        assert_eq!(snapshot.status, RunStatus::Running);
        assert_eq!(snapshot.goal, "simple_recon");
        assert_eq!(snapshot.last_action, Some(ActionId::PortScan));
    }

    #[test]
    fn log_lines_are_timestamped_and_stored() {
        let (session, rx) = SessionHandle::new("s1", "t", default_goal(), 30);
        session.log(3, "port_scan started");
        let snapshot = session.snapshot();
        let line = &snapshot.log[0];
        assert!(line.starts_with('['));
        assert!(line.ends_with("] [step 3] port_scan started"));
        assert_eq!(
            rx.try_recv().expect("event"),
            ScanEvent::Log { line: line.clone() }
        );
    }

    #[test]
    fn complete_is_terminal_once() {
        let (session, rx) = SessionHandle::new("s1", "t", default_goal(), 30);
        session.complete(RunStatus::Aborted, Some("stop requested".to_string()), None);
        session.complete(RunStatus::Finished, None, None);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, RunStatus::Aborted);
        assert_eq!(snapshot.stop_reason.as_deref(), Some("stop requested"));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn events_do_not_block_without_receiver() {
        let (session, rx) = SessionHandle::new("s1", "t", default_goal(), 30);
        drop(rx);
        session.output_line("Initiating SYN Stealth Scan");
        session.log(1, "still fine");
        assert_eq!(session.snapshot().log.len(), 1);
    }

    #[test]
    fn registry_creates_and_finds_sessions() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.create("10.0.0.5", default_goal(), 30);
        assert!(registry.get(session.id()).is_some());
        assert!(registry.get("missing").is_none());

        session.request_stop();
        assert!(registry.get(session.id()).expect("session").stop_requested());

        let listing = registry.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].target, "10.0.0.5");
        assert_eq!(listing[0].status, RunStatus::Running);
    }

    #[test]
    fn registry_evicts_oldest_finished_sessions_only() {
        let registry = SessionRegistry::with_retention(2);
        let (running, _rx1) = registry.create("10.0.0.1", default_goal(), 30);
        let (first, _rx2) = registry.create("10.0.0.2", default_goal(), 30);
        let (second, _rx3) = registry.create("10.0.0.3", default_goal(), 30);
        first.complete(RunStatus::Finished, None, None);
        second.complete(RunStatus::Aborted, None, None);

        let (latest, _rx4) = registry.create("10.0.0.4", default_goal(), 30);
        assert!(registry.get(running.id()).is_some());
        assert!(registry.get(first.id()).is_none());
        assert!(registry.get(second.id()).is_some());
        assert!(registry.get(latest.id()).is_some());

        let targets: Vec<String> = registry.list().into_iter().map(|entry| entry.target).collect();
        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);
    }
}
