//! Deterministic, pure logic shared by the factory.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod jobs;
pub mod recipes;
pub mod record;
pub mod types;
