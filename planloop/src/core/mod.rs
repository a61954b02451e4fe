//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plan values and return deterministic outputs suitable for tests.

pub mod actionable;
pub mod failure;
pub mod index;
pub mod invariants;
pub mod ready;
pub mod state;
