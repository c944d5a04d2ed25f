//! Shared minijinja environment for argv and framing templates.

use anyhow::{Result, anyhow};
use minijinja::{Environment, UndefinedBehavior};

/// Environment with the quoting filters registered and strict undefined handling.
pub fn command_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("psquote", psquote);
    env.add_filter("shquote", shquote);
    env
}

/// Reject a template with a syntax error before it is used for a job.
pub fn check_template(env: &Environment<'static>, source: &str) -> Result<()> {
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|err| anyhow!("invalid template {source:?}: {err}"))
}

/// Single-quote `value` for PowerShell.
pub fn psquote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Single-quote `value` for a POSIX shell.
pub fn shquote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
