//! Shared application state for the scan server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use probescout::io::config::ScoutConfig;
use probescout::io::engine::NmapScanner;
use probescout::io::oracle::OpenAiOracle;
use probescout::io::preflight::preflight;
use probescout::orchestrator::{LoopOutcome, LoopSettings, run_scan};
use probescout::session::{ScanEvent, SessionHandle, SessionRegistry};

const EVENT_CAPACITY: usize = 256;

/// Runs scans on a dedicated OS thread. Both methods are called off the async runtime.
pub trait ScanWorker: Send + Sync + 'static {
    /// Pre-flight for a new scan; failure rejects the request.
    fn check(&self, config: &ScoutConfig) -> Result<()>;

    fn run(&self, session: &SessionHandle, config: &ScoutConfig) -> Result<LoopOutcome>;
}

/// Real scanner and HTTP oracle.
pub struct LiveWorker;

impl ScanWorker for LiveWorker {
    fn check(&self, config: &ScoutConfig) -> Result<()> {
        preflight(config).context("pre-flight")?;
        OpenAiOracle::from_config(&config.oracle).context("oracle setup")?;
        Ok(())
    }

    fn run(&self, session: &SessionHandle, config: &ScoutConfig) -> Result<LoopOutcome> {
        let oracle = OpenAiOracle::from_config(&config.oracle).context("oracle setup")?;
        let scanner = NmapScanner {
            grace: config.grace(),
        };
        run_scan(session, &LoopSettings::from_config(config), &oracle, &scanner)
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Base config; requests may only flip `dry_run` and pick target and goal.
    pub config: Arc<ScoutConfig>,
    pub worker: Arc<dyn ScanWorker>,
    /// Live event fan-out per running session, removed once it completes.
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ScanEvent>>>>,
}

impl AppState {
    pub fn new(config: ScoutConfig, worker: Arc<dyn ScanWorker>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            config: Arc::new(config),
            worker,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<ScanEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the broadcast channel for a new session.
    pub fn open_channel(&self, id: &str) -> broadcast::Sender<ScanEvent> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        self.channels().insert(id.to_string(), tx.clone());
        tx
    }

    pub fn close_channel(&self, id: &str) {
        self.channels().remove(id);
    }

    /// Subscribe to a running session's events; `None` once it has completed.
    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<ScanEvent>> {
        self.channels().get(id).map(broadcast::Sender::subscribe)
    }
}
