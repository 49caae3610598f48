//! Deterministic, pure logic shared by the scan loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod compiler;
pub mod goal;
pub mod intent;
pub mod nmap_xml;
pub mod port_range;
pub mod state;
pub mod summary;
pub mod target;
pub mod types;
pub mod validator;
