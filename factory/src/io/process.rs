//! One-shot child processes with a hard timeout and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long pipe readers may keep draining after the process group is killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Put the child in its own process group.
///
/// Terminal signals then reach only the factory, and the whole tree the child
/// forks can be killed at once with [`kill_process_group`].
pub(crate) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// SIGKILL every process in the child's group, then the child itself.
pub(crate) fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(err = %err, "kill process group");
            }
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill child");
    }
}

type ReaderResult = Result<(Vec<u8>, usize)>;

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// The child runs in its own process group. Output pipes are drained on
/// reader threads while it runs, so a chatty child cannot deadlock on a full
/// pipe. At most `output_limit_bytes` of each stream is kept; the rest is
/// counted and discarded. When `timeout` passes, or when descendants still
/// hold the pipes open at the deadline, the whole group is killed. Readers
/// that stay blocked past a short grace period are abandoned.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    let started = Instant::now();
    let deadline = started + timeout;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing process group");
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let readers_deadline = if timed_out {
        Instant::now() + READER_GRACE
    } else {
        deadline
    };
    let mut stdout = await_reader(&stdout_rx, readers_deadline);
    let mut stderr = await_reader(&stderr_rx, readers_deadline);
    if !timed_out && (stdout.is_none() || stderr.is_none()) {
        warn!("descendants still hold output pipes at the deadline, killing process group");
        timed_out = true;
        kill_process_group(&mut child);
        let grace = Instant::now() + READER_GRACE;
        if stdout.is_none() {
            stdout = await_reader(&stdout_rx, grace);
        }
        if stderr.is_none() {
            stderr = await_reader(&stderr_rx, grace);
        }
    }
    let (stdout, stdout_truncated) = finish_reader(stdout).context("read stdout")?;
    let (stderr, stderr_truncated) = finish_reader(stderr).context("read stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<ReaderResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the reader has been abandoned.
        let _ = tx.send(read_limited(reader, limit));
    });
    rx
}

/// Wait for a reader until `deadline`. `None` means it is still blocked.
fn await_reader(rx: &Receiver<ReaderResult>, deadline: Instant) -> Option<ReaderResult> {
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(anyhow!("output reader thread panicked"))),
    }
}

fn finish_reader(result: Option<ReaderResult>) -> ReaderResult {
    match result {
        Some(result) => result,
        None => {
            warn!("output reader still blocked after kill, abandoning it");
            Ok((Vec::new(), 0))
        }
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> ReaderResult {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }
    Ok((buf, truncated))
}
