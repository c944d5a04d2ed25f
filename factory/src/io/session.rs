//! Remote execution session.
//!
//! [`RemoteSession`] is the capability the job loop holds: open, run, reset and
//! close a single live shell on the lab host. [`ShellSession`] implements it
//! over a long-lived child process (an `ssh` client, or a local shell) by
//! writing one framed command at a time to its stdin and reading output lines
//! until the frame's end marker appears on both stdout and stderr.
//!
//! Every wait is bounded. A command that does not finish within
//! `run_timeout_secs` kills the child and leaves the session `Dead`; the
//! caller must `reset()` before the next `run()`.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::remaining_budget;
use crate::io::config::{SessionConfig, ShellDialect};
use crate::io::process::{isolate_process_group, kill_process_group};
use crate::io::template::{check_template, command_env};

/// Lifecycle of a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    /// A command is in flight.
    Active,
    /// A transport fault was observed; `reset()` is required.
    Dead,
}

/// Result of one command on the lab host. A non-zero `exit_code` is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("command is {len} bytes, over the {limit} byte transport limit")]
    PayloadTooLarge { len: usize, limit: usize },
    #[error("remote command timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session is not open")]
    NotOpen,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("failed to start session process: {0}")]
    Spawn(String),
    #[error("session handshake timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("session handshake failed: {0}")]
    Handshake(String),
}

/// Reject commands the transport is known to mangle.
///
/// The rejection has the same shape as a transport failure so the caller
/// classifies it the same way, without ever transmitting the command.
pub fn check_command_length(command: &str, limit: usize) -> Result<(), RunError> {
    let len = command.len();
    if len > limit {
        return Err(RunError::PayloadTooLarge { len, limit });
    }
    Ok(())
}

/// Capability interface over the single live shell on the lab host.
pub trait RemoteSession {
    fn open(&mut self) -> Result<(), ConnectError>;

    fn run(&mut self, command: &str) -> Result<RunOutput, RunError>;

    /// Tear down and rebuild. Safe in any state, including `Dead`.
    fn reset(&mut self) -> Result<(), ConnectError> {
        self.close();
        self.open()
    }

    /// Best-effort teardown. Never fails.
    fn close(&mut self);

    fn state(&self) -> SessionState;
}

const POSIX_FRAME: &str = "( eval {{ command | shquote }} ) </dev/null; \
__factory_rc=$?; \
printf '%s %s\\n' {{ marker | shquote }} \"$__factory_rc\"; \
printf '%s %s\\n' {{ marker | shquote }} \"$__factory_rc\" >&2";

const POWERSHELL_FRAME: &str = "$global:LASTEXITCODE = 0; $__factory_ok = $true; \
try { $ErrorActionPreference = 'Stop'; \
& ([scriptblock]::Create({{ command | psquote }})) | Out-String -Stream | \
ForEach-Object { [Console]::Out.WriteLine($_) } } \
catch { $__factory_ok = $false; [Console]::Error.WriteLine($_.ToString()) } \
finally { $ErrorActionPreference = 'Continue' }; \
$__factory_rc = if (-not $__factory_ok) { 1 } elseif ($global:LASTEXITCODE) { $global:LASTEXITCODE } else { 0 }; \
[Console]::Out.WriteLine({{ marker | psquote }} + ' ' + $__factory_rc); \
[Console]::Error.WriteLine({{ marker | psquote }} + ' ' + $__factory_rc)";

/// Grace period for a shell to exit after its stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

impl ShellDialect {
    fn frame_template(self) -> &'static str {
        match self {
            ShellDialect::Posix => POSIX_FRAME,
            ShellDialect::Powershell => POWERSHELL_FRAME,
        }
    }

    fn handshake_command(self) -> &'static str {
        match self {
            ShellDialect::Posix => "true",
            ShellDialect::Powershell => "$null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

enum Event {
    Line(Stream, String),
    Closed(Stream),
}

/// Handles of a running shell process.
struct LiveShell {
    child: Child,
    stdin: ChildStdin,
    events: Receiver<Event>,
}

/// Session over a persistent shell process.
pub struct ShellSession {
    config: SessionConfig,
    env: Environment<'static>,
    state: SessionState,
    live: Option<LiveShell>,
    nonce: String,
    sequence: u64,
}

impl ShellSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("session.command must be a non-empty array"));
        }
        let env = command_env();
        check_template(&env, config.dialect.frame_template())?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        Ok(Self {
            config,
            env,
            state: SessionState::Closed,
            live: None,
            nonce: format!("{}_{nanos}", std::process::id()),
            sequence: 0,
        })
    }

    fn next_marker(&mut self) -> String {
        self.sequence += 1;
        format!("__FACTORY_DONE_{}_{}__", self.nonce, self.sequence)
    }

    fn frame(&self, command: &str, marker: &str) -> Result<String, RunError> {
        self.env
            .render_str(
                self.config.dialect.frame_template(),
                context! { command => command, marker => marker },
            )
            .map_err(|err| RunError::Transport(format!("render command frame: {err}")))
    }

    fn spawn(&self) -> Result<LiveShell, ConnectError> {
        let program = &self.config.command[0];
        let mut cmd = Command::new(program);
        cmd.args(&self.config.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|err| ConnectError::Spawn(format!("{program}: {err}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            kill_quietly(&mut child);
            return Err(ConnectError::Spawn("session pipes were not captured".to_string()));
        };
        let (tx, events) = mpsc::channel();
        spawn_reader(stdout, Stream::Stdout, tx.clone());
        spawn_reader(stderr, Stream::Stderr, tx);
        Ok(LiveShell {
            child,
            stdin,
            events,
        })
    }

    /// Drop the shell without waiting for it to wind down.
    fn kill(&mut self) {
        if let Some(mut live) = self.live.take() {
            kill_quietly(&mut live.child);
        }
    }

    fn mark_dead(&mut self) {
        self.kill();
        self.state = SessionState::Dead;
    }
}

impl RemoteSession for ShellSession {
    #[instrument(skip_all, fields(program = %self.config.command[0]))]
    fn open(&mut self) -> Result<(), ConnectError> {
        if self.state == SessionState::Open {
            return Ok(());
        }
        self.kill();
        self.state = SessionState::Closed;

        let live = self.spawn()?;
        self.live = Some(live);

        let marker = self.next_marker();
        let framed = self
            .frame(self.config.dialect.handshake_command(), &marker)
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;
        let timeout = self.config.connect_timeout();
        let limit = self.config.output_limit_bytes;
        let result = match self.live.as_mut() {
            Some(live) => exchange(live, &framed, &marker, timeout, limit),
            None => Err(RunError::NotOpen),
        };
        match result {
            Ok(output) if output.exit_code == 0 => {
                self.state = SessionState::Open;
                info!(elapsed_ms = output.elapsed.as_millis() as u64, "session open");
                Ok(())
            }
            Ok(output) => {
                self.kill();
                Err(ConnectError::Handshake(format!(
                    "handshake exited with code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )))
            }
            Err(RunError::Timeout { after }) => {
                self.kill();
                Err(ConnectError::Timeout { after })
            }
            Err(err) => {
                self.kill();
                Err(ConnectError::Handshake(err.to_string()))
            }
        }
    }

    #[instrument(skip_all, fields(len = command.len()))]
    fn run(&mut self, command: &str) -> Result<RunOutput, RunError> {
        if self.state != SessionState::Open {
            return Err(RunError::NotOpen);
        }
        let marker = self.next_marker();
        let framed = self.frame(command, &marker)?;
        let timeout = self.config.run_timeout();
        let limit = self.config.output_limit_bytes;

        self.state = SessionState::Active;
        let result = match self.live.as_mut() {
            Some(live) => exchange(live, &framed, &marker, timeout, limit),
            None => Err(RunError::NotOpen),
        };
        match result {
            Ok(output) => {
                self.state = SessionState::Open;
                debug!(
                    exit_code = output.exit_code,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "remote command finished"
                );
                Ok(output)
            }
            Err(err) => {
                warn!(err = %err, "session transport fault, marking dead");
                self.mark_dead();
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut live) = self.live.take() {
            drop(live.stdin);
            match live.child.wait_timeout(CLOSE_GRACE) {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => kill_quietly(&mut live.child),
            }
            debug!("session closed");
        }
        self.state = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn kill_quietly(child: &mut Child) {
    kill_process_group(child);
    if let Err(err) = child.wait() {
        debug!(err = %err, "reap session process");
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, stream: Stream, tx: Sender<Event>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(Event::Line(stream, line)).is_err() {
                        return;
                    }
                }
            }
        }
        // The receiver may already be gone after a reset.
        let _ = tx.send(Event::Closed(stream));
    });
}

/// Send one framed command and collect output until both end markers arrive.
fn exchange(
    live: &mut LiveShell,
    framed: &str,
    marker: &str,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<RunOutput, RunError> {
    let started = Instant::now();
    let deadline = started + timeout;
    live.stdin
        .write_all(framed.as_bytes())
        .and_then(|()| live.stdin.write_all(b"\n"))
        .and_then(|()| live.stdin.flush())
        .map_err(|err| RunError::Transport(format!("write to session: {err}")))?;

    let mut stdout = Capture::new(output_limit_bytes);
    let mut stderr = Capture::new(output_limit_bytes);
    let mut exit_code = None;
    let mut stderr_done = false;
    while exit_code.is_none() || !stderr_done {
        let Some(remaining) = remaining_budget(deadline) else {
            return Err(RunError::Timeout { after: timeout });
        };
        match live.events.recv_timeout(remaining) {
            Ok(Event::Line(Stream::Stdout, line)) => match split_marker(&line, marker) {
                Some((prefix, code)) => {
                    stdout.push(prefix);
                    exit_code = Some(code?);
                }
                None => stdout.push_line(&line),
            },
            Ok(Event::Line(Stream::Stderr, line)) => match split_marker(&line, marker) {
                Some((prefix, _)) => {
                    stderr.push(prefix);
                    stderr_done = true;
                }
                None => stderr.push_line(&line),
            },
            Ok(Event::Closed(stream)) => {
                let stderr = stderr.finish();
                let detail = stderr.trim();
                return Err(RunError::Transport(if detail.is_empty() {
                    format!("session {stream} closed")
                } else {
                    format!("session {stream} closed: {detail}")
                }));
            }
            Err(RecvTimeoutError::Timeout) => return Err(RunError::Timeout { after: timeout }),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RunError::Transport("session output disconnected".to_string()));
            }
        }
    }

    Ok(RunOutput {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        exit_code: exit_code.unwrap_or_default(),
        elapsed: started.elapsed(),
    })
}

/// Split a line carrying `marker` into the output before it and the exit code after it.
fn split_marker<'a>(line: &'a str, marker: &str) -> Option<(&'a str, Result<i32, RunError>)> {
    let idx = line.find(marker)?;
    let code = line[idx + marker.len()..].trim();
    let code = code
        .parse::<i32>()
        .map_err(|_| RunError::Transport(format!("malformed exit code {code:?}")));
    Some((&line[..idx], code))
}

/// Output accumulator bounded to a byte limit.
struct Capture {
    buf: String,
    limit: usize,
    truncated: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.push(line);
        self.push("\n");
    }

    fn push(&mut self, text: &str) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if text.len() <= remaining {
            self.buf.push_str(text);
            return;
        }
        let mut keep = remaining;
        while !text.is_char_boundary(keep) {
            keep -= 1;
        }
        self.buf.push_str(&text[..keep]);
        self.truncated += text.len() - keep;
    }

    fn finish(self) -> String {
        if self.truncated == 0 {
            return self.buf;
        }
        format!("{}\n[truncated {} bytes]", self.buf, self.truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_guard_rejects_oversize_commands() {
        assert_eq!(check_command_length(&"a".repeat(8000), 8000), Ok(()));
        assert_eq!(
            check_command_length(&"a".repeat(9000), 8000),
            Err(RunError::PayloadTooLarge {
                len: 9000,
                limit: 8000
            })
        );
    }

    #[test]
    fn splits_marker_from_partial_output() {
        let (prefix, code) = split_marker("abc__END__ 3", "__END__").expect("marker");
        assert_eq!(prefix, "abc");
        assert_eq!(code, Ok(3));
        assert!(split_marker("no marker here", "__END__").is_none());
    }

    #[test]
    fn capture_truncates_on_char_boundary() {
        let mut capture = Capture::new(5);
        capture.push_line("éé");
        capture.push_line("more");
        assert_eq!(capture.finish(), "éé\n\n[truncated 5 bytes]");
    }

    #[test]
    fn powershell_frame_renders() {
        let session = ShellSession::new(SessionConfig::default()).expect("session");
        let framed = session.frame("Write-Output 'hi'", "__M__").expect("frame");
        assert!(framed.contains("[scriptblock]::Create('Write-Output ''hi''')"));
        assert!(framed.contains("'__M__'"));
        assert!(!framed.contains('\n'));
    }

    #[cfg(unix)]
    fn sh_session(run_timeout_secs: u64) -> ShellSession {
        ShellSession::new(SessionConfig {
            command: vec!["sh".to_string()],
            dialect: ShellDialect::Posix,
            connect_timeout_secs: 5,
            run_timeout_secs,
            output_limit_bytes: 4096,
        })
        .expect("session")
    }

    #[cfg(unix)]
    #[test]
    fn runs_commands_and_captures_streams() {
        let mut session = sh_session(5);
        assert_eq!(session.state(), SessionState::Closed);
        session.open().expect("open");
        assert_eq!(session.state(), SessionState::Open);

        let output = session.run("echo hello; echo oops >&2").expect("run");
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, 0);

        let output = session.run("printf 'no newline'").expect("run");
        assert_eq!(output.stdout, "no newline");

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    /// Verifies the shell runs outside the factory's process group, so a
    /// terminal interrupt reaches only the factory.
    #[cfg(unix)]
    #[test]
    fn shell_runs_in_its_own_process_group() {
        use nix::unistd::{Pid, getpgid, getpgrp};

        let mut session = sh_session(5);
        session.open().expect("open");
        let pid = session.live.as_ref().expect("live shell").child.id();
        let pid = Pid::from_raw(i32::try_from(pid).expect("pid"));
        let group = getpgid(Some(pid)).expect("getpgid");
        assert_eq!(group, pid);
        assert_ne!(group, getpgrp());
        session.close();
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_not_a_transport_error() {
        let mut session = sh_session(5);
        session.open().expect("open");
        let output = session.run("echo denied >&2; exit 3").expect("run");
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr, "denied\n");
        assert_eq!(session.state(), SessionState::Open);
    }

    #[cfg(unix)]
    #[test]
    fn commands_run_in_isolation() {
        let mut session = sh_session(5);
        session.open().expect("open");
        session.run("FACTORY_MARK=set; cd /").expect("run");
        let output = session.run("echo ${FACTORY_MARK:-unset}").expect("run");
        assert_eq!(output.stdout, "unset\n");
        let output = session.run("echo \"it's quoted\"").expect("run");
        assert_eq!(output.stdout, "it's quoted\n");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_session_and_reset_recovers() {
        let mut session = sh_session(1);
        session.open().expect("open");

        let err = session.run("sleep 5").unwrap_err();
        assert_eq!(
            err,
            RunError::Timeout {
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(session.state(), SessionState::Dead);
        assert_eq!(session.run("echo hi").unwrap_err(), RunError::NotOpen);

        session.reset().expect("reset");
        assert_eq!(session.state(), SessionState::Open);
        let output = session.run("echo back").expect("run");
        assert_eq!(output.stdout, "back\n");
    }

    #[cfg(unix)]
    #[test]
    fn open_reports_missing_program() {
        let mut session = ShellSession::new(SessionConfig {
            command: vec!["/nonexistent/factory-shell".to_string()],
            ..SessionConfig::default()
        })
        .expect("session");
        assert!(matches!(session.open(), Err(ConnectError::Spawn(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn open_fails_when_shell_exits_immediately() {
        let mut session = ShellSession::new(SessionConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            dialect: ShellDialect::Posix,
            connect_timeout_secs: 5,
            run_timeout_secs: 5,
            output_limit_bytes: 4096,
        })
        .expect("session");
        assert!(matches!(session.open(), Err(ConnectError::Handshake(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn run_requires_open_session() {
        let mut session = ShellSession::new(SessionConfig::default()).expect("session");
        assert_eq!(session.run("whoami").unwrap_err(), RunError::NotOpen);
    }
}
