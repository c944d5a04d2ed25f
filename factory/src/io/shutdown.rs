//! Cooperative shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

/// Shared flag the job loop polls between jobs.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route SIGINT and SIGTERM into a [`ShutdownFlag`].
///
/// The first signal only sets the flag, so the run drains at the next job
/// boundary and still writes its final checkpoint. A second signal while the
/// flag is set terminates the process immediately.
pub fn install_signal_handlers() -> Result<ShutdownFlag> {
    let shutdown = ShutdownFlag::new();
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&shutdown.0))
            .with_context(|| format!("register shutdown handler for signal {signal}"))?;
        flag::register(signal, Arc::clone(&shutdown.0))
            .with_context(|| format!("register drain handler for signal {signal}"))?;
    }
    Ok(shutdown)
}
