//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod admission;
pub mod backoff;
pub mod failure;
pub mod judge;
pub mod policy;
pub mod session;
pub mod types;
