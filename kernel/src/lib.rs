//! Deterministic gating kernel and parallel scheduler for repair-plan benchmarks.
//!
//! A plan proposed by an external generator passes through a fixed pipeline
//! before anything touches a repository:
//!
//! - **[`core`]**: Pure, deterministic logic (plan model, gate, critique,
//!   patch summary, outcome classification, tie-break). No I/O, fully testable
//!   in isolation.
//! - **[`io`]**: Side-effecting operations (config, process execution,
//!   snapshots, the sandboxed executor, audit logs).
//!
//! Orchestration modules ([`controller`], [`worker`], [`scheduler`],
//! [`preflight`]) coordinate core logic with I/O.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod preflight;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
