//! Scan configuration stored in `probescout.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Budgets;
use crate::core::compiler::ScanPolicy;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "probescout.toml";

/// Scan configuration (TOML).
///
/// Missing fields and sections fall back to the defaults below, so an empty
/// or absent file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoutConfig {
    /// Default scan target when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Default goal id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    pub scanner: ScannerConfig,
    pub budget: BudgetConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub nmap_path: String,

    /// Run raw-socket scans through `sudo -n`.
    pub use_sudo: bool,

    /// Decide actions but never spawn the scanner.
    pub dry_run: bool,

    pub scan_timeout_secs: u64,

    /// Timeout for exhaustive `1-65535` invocations.
    pub full_range_timeout_secs: u64,

    /// Added on top of the scan timeout before the child is killed.
    pub grace_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            use_sudo: true,
            dry_run: false,
            scan_timeout_secs: 300,
            full_range_timeout_secs: 3600,
            grace_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_iterations: u32,
    pub max_invocations: u32,
    pub max_elapsed_secs: u64,

    /// Pause between scanner invocations.
    pub cooling: bool,
    pub cooling_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_invocations: 25,
            max_elapsed_secs: 3600,
            cooling: true,
            cooling_secs: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// OpenAI-compatible API root (without `/chat/completions`).
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// File holding the API key, used when the environment variable is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<PathBuf>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout_secs: 90,
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key_file: None,
        }
    }
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            target: None,
            goal: None,
            scanner: ScannerConfig::default(),
            budget: BudgetConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl ScoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scanner.nmap_path.trim().is_empty() {
            return Err(anyhow!("scanner.nmap_path must be non-empty"));
        }
        if self.scanner.scan_timeout_secs == 0 {
            return Err(anyhow!("scanner.scan_timeout_secs must be > 0"));
        }
        if self.scanner.full_range_timeout_secs == 0 {
            return Err(anyhow!("scanner.full_range_timeout_secs must be > 0"));
        }
        if self.budget.max_iterations == 0 {
            return Err(anyhow!("budget.max_iterations must be > 0"));
        }
        if self.budget.max_invocations == 0 {
            return Err(anyhow!("budget.max_invocations must be > 0"));
        }
        if self.budget.max_elapsed_secs == 0 {
            return Err(anyhow!("budget.max_elapsed_secs must be > 0"));
        }
        if self.oracle.base_url.trim().is_empty() {
            return Err(anyhow!("oracle.base_url must be non-empty"));
        }
        if self.oracle.model.trim().is_empty() {
            return Err(anyhow!("oracle.model must be non-empty"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return Err(anyhow!("oracle.temperature must be within 0.0..=2.0"));
        }
        Ok(())
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            program: self.scanner.nmap_path.clone(),
            elevation_enabled: self.scanner.use_sudo,
            scan_timeout: Duration::from_secs(self.scanner.scan_timeout_secs),
            full_range_timeout: Duration::from_secs(self.scanner.full_range_timeout_secs),
        }
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_iterations: self.budget.max_iterations,
            max_invocations: self.budget.max_invocations,
            max_elapsed: Duration::from_secs(self.budget.max_elapsed_secs),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.scanner.grace_secs)
    }

    /// Pause between invocations, `None` when cooling is off.
    pub fn cooling(&self) -> Option<Duration> {
        (self.budget.cooling && self.budget.cooling_secs > 0)
            .then(|| Duration::from_secs(self.budget.cooling_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ScoutConfig::default()`.
pub fn load_config(path: &Path) -> Result<ScoutConfig> {
    if !path.exists() {
        let cfg = ScoutConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ScoutConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ScoutConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ScoutConfig::default());
        assert_eq!(cfg.budget.max_iterations, 30);
        assert_eq!(cfg.budget.max_invocations, 25);
        assert_eq!(cfg.oracle.model, "gpt-4o-mini");
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("probescout.toml");
        let mut cfg = ScoutConfig::default();
        cfg.target = Some("10.0.0.5".to_string());
        cfg.scanner.use_sudo = false;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("probescout.toml");
        fs::write(
            &path,
            "goal = \"web_ports\"\n[scanner]\ndry_run = true\n[budget]\ncooling = false\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.goal.as_deref(), Some("web_ports"));
        assert!(cfg.scanner.dry_run);
        assert_eq!(cfg.scanner.nmap_path, "nmap");
        assert_eq!(cfg.cooling(), None);
        assert_eq!(cfg.budgets().max_elapsed, Duration::from_secs(3600));
    }

    #[test]
    fn rejects_zero_budgets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("probescout.toml");
        fs::write(&path, "[budget]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn scan_policy_follows_scanner_section() {
        let mut cfg = ScoutConfig::default();
        cfg.scanner.nmap_path = "/usr/local/bin/nmap".to_string();
        cfg.scanner.use_sudo = false;
        let policy = cfg.scan_policy();
        assert_eq!(policy.program, "/usr/local/bin/nmap");
        assert!(!policy.elevation_enabled);
        assert_eq!(policy.scan_timeout, Duration::from_secs(300));
        assert_eq!(policy.full_range_timeout, Duration::from_secs(3600));
    }
}
