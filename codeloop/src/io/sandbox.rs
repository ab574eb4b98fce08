//! Sandboxed execution of admitted source.
//!
//! The [`Sandbox`] trait decouples the supervisor from process spawning.
//! [`ProcessSandbox`] runs each program in a fresh temporary directory, in
//! its own process group, under resource ceilings. It never judges the
//! result: a non-zero exit is data in the [`ExecutionRecord`], not an error.

use std::fs;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{ExecutionRecord, ExitStatus};
use crate::io::config::ExecutionConfig;
use crate::io::process::{CommandOutput, ResourceLimits, contain, run_command_with_timeout};

const SCRIPT_NAME: &str = "script.py";

/// Abstraction over isolated execution backends.
pub trait Sandbox {
    /// Run `source` to completion, timeout, or cancellation.
    ///
    /// Errors are reserved for infrastructure failures (the interpreter could
    /// not be started) and for cancellation.
    fn run(&self, source: &str, timeout: Duration, cancel: &CancelToken) -> Result<ExecutionRecord>;
}

impl<T: Sandbox + ?Sized> Sandbox for &T {
    fn run(&self, source: &str, timeout: Duration, cancel: &CancelToken) -> Result<ExecutionRecord> {
        (**self).run(source, timeout, cancel)
    }
}

/// Sandbox that spawns an interpreter process per run.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    output_limit_bytes: usize,
    limits: ResourceLimits,
}

impl ProcessSandbox {
    pub fn new(interpreter: Vec<String>) -> Result<Self> {
        if interpreter.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("interpreter command must not be empty"));
        }
        Ok(Self {
            interpreter,
            output_limit_bytes: 100_000,
            limits: ResourceLimits::default(),
        })
    }

    pub fn from_config(config: &ExecutionConfig) -> Result<Self> {
        Ok(Self::new(config.interpreter.clone())?
            .with_output_limit(config.output_limit_bytes)
            .with_limits(config.limits()))
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), source_bytes = source.len()))]
    fn run(&self, source: &str, timeout: Duration, cancel: &CancelToken) -> Result<ExecutionRecord> {
        let workdir = tempfile::Builder::new()
            .prefix("codeloop-")
            .tempdir()
            .context("create sandbox directory")?;
        let script = workdir.path().join(SCRIPT_NAME);
        fs::write(&script, source)
            .with_context(|| format!("write script {}", script.display()))?;

        let (program, args) = self
            .interpreter
            .split_first()
            .ok_or_else(|| anyhow!("interpreter command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&script)
            .current_dir(workdir.path())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1");
        contain(&mut cmd, self.limits);

        info!(interpreter = %program, "executing admitted source");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes, cancel)
            .with_context(|| format!("run {program}"))?;

        let record = to_record(output);
        match record.status {
            ExitStatus::Normal => debug!(duration_ms = record.duration.as_millis() as u64, "run exited normally"),
            status => warn!(?status, "run terminated abnormally"),
        }
        Ok(record)
    }
}

fn to_record(output: CommandOutput) -> ExecutionRecord {
    let status = if output.timed_out {
        ExitStatus::Timeout
    } else if output.status.success() {
        ExitStatus::Normal
    } else {
        ExitStatus::Crashed {
            code: output.status.code(),
            signal: output.signal(),
        }
    };
    ExecutionRecord {
        status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: output.elapsed,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_interpreter_is_rejected() {
        assert!(ProcessSandbox::new(Vec::new()).is_err());
        assert!(ProcessSandbox::new(vec![" ".to_string()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn runs_script_in_private_directory() {
        let sandbox = ProcessSandbox::new(vec!["sh".to_string()]).expect("sandbox");
        let record = sandbox
            .run("pwd; echo hi > note.txt; cat note.txt", Duration::from_secs(10), &CancelToken::new())
            .expect("run");
        assert_eq!(record.status, ExitStatus::Normal);
        let mut lines = record.stdout.lines();
        let cwd = lines.next().expect("pwd");
        assert!(cwd.contains("codeloop-"), "{cwd}");
        assert_eq!(lines.next(), Some("hi"));
        assert!(!std::path::Path::new(cwd).exists());
    }
}
