//! Scanner execution backends.
//!
//! The [`Scanner`] trait decouples the scan loop from the real `nmap`
//! process. Tests use scripted scanners that return canned XML without
//! spawning anything.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::compiler::Invocation;
use crate::core::nmap_xml::{ScanResult, parse_scan_xml};
use crate::io::process::{ExitOutcome, LineEvent, StreamKind, spawn_lines};

/// Result of one scanner invocation.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Structured (XML) output, empty when the invocation timed out.
    pub xml: String,
    /// Human-readable diagnostic stream.
    pub diagnostics: String,
    pub exit: ExitOutcome,
}

impl ScanOutput {
    /// Parsed structured result; `None` means "no data for this action".
    pub fn parse(&self) -> Option<ScanResult> {
        if self.xml.trim().is_empty() {
            return None;
        }
        parse_scan_xml(&self.xml)
    }
}

/// Abstraction over scanner execution backends.
pub trait Scanner {
    /// Run the invocation. `on_line` receives diagnostic lines as they arrive.
    fn execute(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str))
    -> Result<ScanOutput>;
}

/// Scanner that spawns the compiled argv directly (no shell).
pub struct NmapScanner {
    /// Added to the invocation timeout before the child is killed.
    pub grace: Duration,
}

impl Scanner for NmapScanner {
    #[instrument(skip_all, fields(action = %invocation.action, elevated = invocation.elevated))]
    fn execute(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ScanOutput> {
        let deadline = invocation.timeout + self.grace;
        info!(
            command = %invocation.command_line(),
            timeout_secs = deadline.as_secs(),
            "starting scanner"
        );
        let events = spawn_lines(&invocation.program, &invocation.args, deadline)
            .context("start scanner")?;

        let mut output = ScanOutput::default();
        for event in events {
            match event {
                LineEvent::Line(StreamKind::Stdout, line) => {
                    output.xml.push_str(&line);
                    output.xml.push('\n');
                }
                LineEvent::Line(StreamKind::Stderr, line) => {
                    on_line(&line);
                    output.diagnostics.push_str(&line);
                    output.diagnostics.push('\n');
                }
                LineEvent::Exit(exit) => output.exit = exit,
            }
        }

        if output.exit.timed_out {
            warn!(timeout_secs = deadline.as_secs(), "scanner timed out");
            output.xml.clear();
            if output.exit.code == Some(0) {
                output.exit.code = None;
            }
        } else if !output.exit.success() {
            warn!(exit_code = ?output.exit.code, "scanner exited with failure");
        }
        debug!(xml_bytes = output.xml.len(), "scanner finished");
        Ok(output)
    }
}
