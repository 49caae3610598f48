//! I/O helpers for scan sessions: processes, the oracle, config and prompts.

pub mod config;
pub mod engine;
pub mod oracle;
pub mod preflight;
pub mod process;
pub mod prompt;
