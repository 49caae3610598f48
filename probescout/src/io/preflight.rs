//! Pre-flight checks run once before the first iteration.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::core::compiler::{ScanPolicy, compile};
use crate::core::intent::{Intent, IntentKind, IntentParams};
use crate::core::port_range::PortRange;
use crate::core::validator::{Action, ActionKind};
use crate::io::config::ScoutConfig;
use crate::io::process::run_command_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TARGET: &str = "127.0.0.1";

/// Result of a successful pre-flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// First line of `nmap --version`, absent in dry runs.
    pub scanner_version: Option<String>,
    pub elevation_checked: bool,
}

/// Check the scan policy and, unless dry-running, the scanner binary and `sudo -n`.
#[instrument(skip_all, fields(dry_run = config.scanner.dry_run, use_sudo = config.scanner.use_sudo))]
pub fn preflight(config: &ScoutConfig) -> Result<PreflightReport> {
    let policy = config.scan_policy();
    check_policy(&policy)?;
    if config.scanner.dry_run {
        info!("dry run: skipping scanner checks");
        return Ok(PreflightReport::default());
    }

    let version = run_command_with_timeout(&policy.program, &["--version".to_string()], PROBE_TIMEOUT)
        .with_context(|| format!("{} not runnable", policy.program))?;
    if !version.exit.success() {
        bail!(
            "{} --version failed (exit {:?})",
            policy.program,
            version.exit.code
        );
    }
    let scanner_version = version
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);

    if policy.elevation_enabled {
        let args = vec![
            "-n".to_string(),
            policy.program.clone(),
            "--version".to_string(),
        ];
        let sudo = run_command_with_timeout("sudo", &args, PROBE_TIMEOUT).context("run sudo -n")?;
        if !sudo.exit.success() {
            bail!("sudo -n {} failed (password required?)", policy.program);
        }
    }

    info!(version = ?scanner_version, "pre-flight passed");
    Ok(PreflightReport {
        scanner_version,
        elevation_checked: policy.elevation_enabled,
    })
}

/// Compile a representative port scan so policy violations surface before any invocation.
pub fn check_policy(policy: &ScanPolicy) -> Result<()> {
    let probe = Action {
        kind: ActionKind::PortScan {
            range: PortRange::full(),
        },
        intent: Intent {
            kind: IntentKind::PortScan,
            params: IntentParams::default(),
            reason: None,
            reasoning: None,
            plan: None,
        },
    };
    compile(&probe, PROBE_TARGET, policy, &[]).context("scan policy check")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevation_disabled_fails_policy_check() {
        let mut config = ScoutConfig::default();
        config.scanner.use_sudo = false;
        config.scanner.dry_run = true;
        let err = preflight(&config).unwrap_err();
        assert!(format!("{err:#}").contains("elevated execution is disabled"));
    }

    #[test]
    fn dry_run_skips_binary_checks() {
        let mut config = ScoutConfig::default();
        config.scanner.dry_run = true;
        config.scanner.nmap_path = "/nonexistent/nmap".to_string();
        assert_eq!(preflight(&config).expect("preflight"), PreflightReport::default());
    }

    #[test]
    fn missing_scanner_binary_fails() {
        let mut config = ScoutConfig::default();
        config.scanner.nmap_path = "/nonexistent/nmap".to_string();
        let err = preflight(&config).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nmap not runnable"));
    }
}
