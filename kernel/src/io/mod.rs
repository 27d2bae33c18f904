//! I/O helpers for the kernel.

pub mod audit_log;
pub mod config;
pub mod process;
pub mod sandbox;
pub mod snapshot;
