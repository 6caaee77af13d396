//! Deterministic, pure logic shared by the runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod decide;
pub mod lifecycle;
pub mod path_policy;
pub mod risk;
pub mod signal;
pub mod summary;
pub mod types;
