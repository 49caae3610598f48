//! Goal-driven network reconnaissance over an external scanner.
//!
//! A decision oracle proposes the next step; everything it says is treated as
//! untrusted input. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scan state, goals, intent
//!   validation, invocation compilation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (scanner processes, the oracle
//!   HTTP client, config files, prompt templates).
//!
//! [`orchestrator`] runs the loop, [`session`] shares its progress with
//! pollers, and [`report`] renders the results.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
