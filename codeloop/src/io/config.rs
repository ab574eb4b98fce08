//! Supervisor configuration stored in `.codeloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffSchedule;
use crate::core::judge::{OutputJudge, SignalRule, default_rules};
use crate::core::policy::AdmissionPolicy;
use crate::io::process::ResourceLimits;

pub const DEFAULT_CONFIG_PATH: &str = ".codeloop/config.toml";

/// Supervisor configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodeloopConfig {
    /// Regenerations allowed after the first attempt.
    pub max_retries: usize,

    /// Diagnostics fed back into generation are cut to this many characters.
    pub diagnostic_max_chars: usize,

    pub admission: AdmissionPolicy,
    pub execution: ExecutionConfig,
    pub upstream: UpstreamConfig,
    pub generator: GeneratorConfig,
    pub judge: JudgeConfig,
    pub capabilities: CapabilitiesConfig,
    pub attempt_log: AttemptLogConfig,
}

impl Default for CodeloopConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            diagnostic_max_chars: 500,
            admission: AdmissionPolicy::default(),
            execution: ExecutionConfig::default(),
            upstream: UpstreamConfig::default(),
            generator: GeneratorConfig::default(),
            judge: JudgeConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            attempt_log: AttemptLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Interpreter command; the script path is appended (e.g. `["python3"]`).
    pub interpreter: Vec<String>,

    /// Wall-clock limit per run in seconds.
    pub timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Address-space ceiling. 0 disables.
    pub memory_limit_bytes: u64,

    /// CPU-time ceiling. 0 disables.
    pub cpu_limit_secs: u64,

    /// Process-count ceiling (per user on Linux). 0 disables.
    pub max_processes: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 100_000,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_limit_secs: 120,
            max_processes: 0,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self.memory_limit_bytes,
            cpu_secs: self.cpu_limit_secs,
            max_processes: self.max_processes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Seconds slept before each retry of a transient upstream failure.
    pub retry_delays_secs: Vec<u64>,

    /// Substrings in a failed generator's stderr that mark the failure transient.
    pub transient_markers: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            retry_delays_secs: vec![2, 4, 8],
            transient_markers: ["429", "RESOURCE_EXHAUSTED", "quota", "rate limit", "503", "UNAVAILABLE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UpstreamConfig {
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule::from_secs(&self.retry_delays_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and prints generated code.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JudgeConfig {
    /// Ordered error-signal table; first fatal match wins.
    pub rules: Vec<SignalRule>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub enabled: bool,
    /// JSONL file successful sources are appended to.
    pub path: PathBuf,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".codeloop/capabilities.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttemptLogConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for AttemptLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".codeloop/sessions"),
        }
    }
}

impl CodeloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.diagnostic_max_chars < 16 {
            return Err(anyhow!("diagnostic_max_chars must be >= 16"));
        }
        self.admission.validate()?;

        let execution = &self.execution;
        if execution.interpreter.is_empty() || execution.interpreter[0].trim().is_empty() {
            return Err(anyhow!("execution.interpreter must be a non-empty array"));
        }
        if execution.timeout_secs == 0 {
            return Err(anyhow!("execution.timeout_secs must be > 0"));
        }
        if execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }

        self.upstream.schedule().validate()?;
        if self
            .upstream
            .transient_markers
            .iter()
            .any(|marker| marker.trim().is_empty())
        {
            return Err(anyhow!("upstream.transient_markers must not contain empty entries"));
        }

        let generator = &self.generator;
        if generator.command.is_empty() || generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }

        OutputJudge::new(&self.judge.rules).context("judge.rules")?;

        if self.capabilities.enabled && self.capabilities.path.as_os_str().is_empty() {
            return Err(anyhow!("capabilities.path must be set when enabled"));
        }
        if self.attempt_log.enabled && self.attempt_log.dir.as_os_str().is_empty() {
            return Err(anyhow!("attempt_log.dir must be set when enabled"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CodeloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<CodeloopConfig> {
    if !path.exists() {
        let cfg = CodeloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CodeloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CodeloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write the default config unless one exists and `force` is false.
///
/// Returns whether a file was written.
pub fn init_config(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    write_config(path, &CodeloopConfig::default())?;
    Ok(true)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::judge::SignalKind;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CodeloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let cfg = CodeloopConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_retries = 4\n\n[execution]\ntimeout_secs = 5\n\n[[judge.rules]]\nkind = \"missing_resource\"\npattern = \"not found\"\ncase_sensitive = false\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 4);
        assert_eq!(cfg.execution.timeout_secs, 5);
        assert_eq!(cfg.execution.interpreter, vec!["python3".to_string()]);
        assert_eq!(cfg.judge.rules.len(), 1);
        assert_eq!(cfg.judge.rules[0].kind, SignalKind::MissingResource);
        assert!(!cfg.judge.rules[0].case_sensitive);
    }

    #[test]
    fn invalid_judge_rule_fails_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[[judge.rules]]\nkind = \"generic_error\"\npattern = \"(\"\nregex = true\n",
        )
        .expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("judge.rules"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = CodeloopConfig::default();
        cfg.execution.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn init_respects_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        assert!(init_config(&path, false).expect("init"));
        fs::write(&path, "max_retries = 7\n").expect("edit");
        assert!(!init_config(&path, false).expect("init again"));
        assert_eq!(load_config(&path).expect("load").max_retries, 7);
        assert!(init_config(&path, true).expect("force"));
        assert_eq!(load_config(&path).expect("load").max_retries, 2);
    }
}
