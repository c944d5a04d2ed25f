//! Append-only audit log (`audit_log_path`, one JSON record per line).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use crate::core::classifier::truncate_details;
use crate::core::types::{AuditRecord, JobKey, Outcome};

/// Build an audit record stamped with the current UTC time.
pub fn audit_record(job: &JobKey, status: Outcome, details: &str, detail_limit: usize) -> AuditRecord {
    AuditRecord {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        primitive_id: job.primitive_id.clone(),
        recipe: job.recipe.clone(),
        status,
        details: truncate_details(details, detail_limit),
        prompt: None,
    }
}

/// Writer handle. Every append is flushed before it returns.
pub struct AuditLog {
    path: PathBuf,
    file: File,
    /// Length of the file after the last complete line this handle wrote.
    len: u64,
}

impl AuditLog {
    /// Open (or create) the log for appending.
    ///
    /// A torn final line left by a crash is cut off first, so the next record
    /// starts on its own line.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        let len = file.metadata().context("stat audit log")?.len();
        let complete = complete_prefix_len(&mut file, len)?;
        if complete < len {
            warn!(dropped_bytes = len - complete, "audit log ends with a partial line, cutting it");
            file.set_len(complete)
                .with_context(|| format!("repair audit log {}", path.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: complete,
        })
    }

    /// Append one record as a single line.
    ///
    /// A failed write is rolled back to the last complete line, and any stray
    /// bytes found past it are cut before writing, so a retried append never
    /// lands after a fragment.
    pub fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize audit record")?;
        line.push('\n');
        self.cut_stray_tail()?;
        let written = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush());
        if let Err(err) = written {
            if let Err(rollback) = self.file.set_len(self.len) {
                warn!(err = %rollback, "roll back partial audit line");
            }
            return Err(err).with_context(|| format!("append audit log {}", self.path.display()));
        }
        self.len += line.len() as u64;
        debug!(job = %record.job_key(), status = %record.status, "audit record appended");
        Ok(())
    }

    fn cut_stray_tail(&mut self) -> Result<()> {
        let actual = self.file.metadata().context("stat audit log")?.len();
        if actual == self.len {
            return Ok(());
        }
        let keep = if actual > self.len {
            self.len
        } else {
            complete_prefix_len(&mut self.file, actual)?
        };
        warn!(expected = self.len, actual, keep, "audit log tail changed since the last append, cutting it");
        self.file
            .set_len(keep)
            .with_context(|| format!("repair audit log {}", self.path.display()))?;
        self.len = keep;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Length of the file up to and including its last newline.
fn complete_prefix_len(file: &mut File, len: u64) -> Result<u64> {
    const CHUNK: u64 = 4096;
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).context("seek audit log")?;
        file.read_exact(chunk).context("read audit log tail")?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Read every record in file order.
///
/// A missing file is an empty log. An unparseable final line is treated as a
/// write torn by a crash and skipped; an unparseable line anywhere else is an
/// error.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    let lines: Vec<(usize, &str)> = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let mut records = Vec::with_capacity(lines.len());
    for (pos, (idx, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<AuditRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if pos + 1 == lines.len() => {
                warn!(line = idx + 1, err = %err, "skipping torn final audit line");
            }
            Err(err) => {
                return Err(anyhow!(
                    "parse audit log {} line {}: {err}",
                    path.display(),
                    idx + 1
                ));
            }
        }
    }
    Ok(records)
}
