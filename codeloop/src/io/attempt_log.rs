//! Per-attempt logs under `<dir>/<run>/<session>/<attempt>/`.
//!
//! Product artifacts for auditing a session after the fact. Unlike tracing
//! output they do not depend on `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::session::{Attempt, AttemptOutcome};
use crate::core::types::{Diagnostic, ExecutionRecord, ExitStatus, SessionId};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub session_id: SessionId,
    pub command: &'a str,
    pub attempt: usize,
    pub diagnostic: Option<&'a Diagnostic>,
    pub outcome: &'a AttemptOutcome,
    pub exit_status: Option<ExitStatus>,
    pub duration_ms: Option<u64>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub logged_at: String,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub source_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, session_id: SessionId, attempt: usize) -> Self {
        let dir = run_dir
            .join(session_id.to_string())
            .join(attempt.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            source_path: dir.join("source.py"),
            stdout_path: dir.join("stdout.log"),
            stderr_path: dir.join("stderr.log"),
            dir,
        }
    }
}

/// Writer for one supervisor process's attempt logs.
///
/// Each process gets its own timestamped run directory, so session ids
/// restarting at 1 never collide with earlier runs.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    run_dir: PathBuf,
}

impl AttemptLog {
    pub fn new(root: &Path) -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        Self::at(root.join(stamp))
    }

    /// Log into an explicit run directory.
    pub fn at(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn write(
        &self,
        session_id: SessionId,
        command: &str,
        attempt: &Attempt,
        record: Option<&ExecutionRecord>,
    ) -> Result<AttemptPaths> {
        let paths = AttemptPaths::new(&self.run_dir, session_id, attempt.index);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        let meta = AttemptMeta {
            session_id,
            command,
            attempt: attempt.index,
            diagnostic: attempt.diagnostic.as_ref(),
            outcome: &attempt.outcome,
            exit_status: record.map(|r| r.status),
            duration_ms: record.map(|r| r.duration.as_millis() as u64),
            stdout_truncated: record.map_or(0, |r| r.stdout_truncated),
            stderr_truncated: record.map_or(0, |r| r.stderr_truncated),
            logged_at: chrono::Utc::now().to_rfc3339(),
        };

        // Write in deterministic order to keep logs stable.
        write_json(&paths.meta_path, &meta)?;
        if let Some(source) = &attempt.source {
            write_text(&paths.source_path, source)?;
        }
        if let Some(record) = record {
            write_text(&paths.stdout_path, &record.stdout)?;
            write_text(&paths.stderr_path, &record.stderr)?;
        }
        Ok(paths)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
