//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod critique;
pub mod gate;
pub mod graph;
pub mod outcome;
pub mod patch;
pub mod plan;
pub mod policy;
pub mod tiebreak;
