//! I/O helpers for the factory: processes, the lab session, and on-disk artifacts.

pub mod audit_log;
pub mod config;
pub mod engine;
pub mod init;
pub mod primitives;
pub mod process;
pub mod session;
pub mod shutdown;
pub mod state_store;
pub mod template;
