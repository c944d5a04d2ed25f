//! Resilient combinatorial job engine for building an obfuscated command corpus.
//!
//! Every primitive command is combined with every obfuscation recipe; each
//! resulting job is transformed by an external technique engine, executed on a
//! flaky lab host, classified, and checkpointed so a killed run resumes where
//! it left off. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (recipes, job space, classification,
//!   record construction). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, the lab session,
//!   checkpoints, audit log). Isolated behind traits to enable test doubles.
//!
//! The [`factory`] module coordinates the two into the job loop; [`status`]
//! reports progress without touching the lab host.

pub mod core;
pub mod exit_codes;
pub mod factory;
pub mod io;
pub mod logging;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
