//! Output judge: decides effective success from an execution record.
//!
//! A run can exit 0 while its output narrates a failure, so exit status alone
//! is not trusted. Rules are an ordered, configurable table; the first fatal
//! rule that matches wins.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{ExecutionRecord, ExitStatus, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    UncaughtException,
    ReadFailure,
    MissingResource,
    PermissionDenied,
    GenericError,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::UncaughtException => "uncaught_exception",
            SignalKind::ReadFailure => "read_failure",
            SignalKind::MissingResource => "missing_resource",
            SignalKind::PermissionDenied => "permission_denied",
            SignalKind::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A match fails the run.
    #[default]
    Fatal,
    /// A match is logged and otherwise ignored.
    Advisory,
}

/// One entry in the error-signal table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRule {
    pub kind: SignalKind,
    pub pattern: String,
    /// Treat `pattern` as a regular expression instead of a literal.
    #[serde(default)]
    pub regex: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// Only match at word boundaries.
    #[serde(default)]
    pub whole_word: bool,
    #[serde(default)]
    pub severity: Severity,
}

fn default_true() -> bool {
    true
}

impl SignalRule {
    pub fn literal(kind: SignalKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            regex: false,
            case_sensitive: true,
            whole_word: false,
            severity: Severity::Fatal,
        }
    }

    pub fn whole_word(mut self) -> Self {
        self.whole_word = true;
        self
    }

    pub fn advisory(mut self) -> Self {
        self.severity = Severity::Advisory;
        self
    }

    fn compile(&self) -> Result<Regex> {
        if self.pattern.is_empty() {
            return Err(anyhow!("judge rule pattern must not be empty"));
        }
        let mut pattern = if self.regex {
            self.pattern.clone()
        } else {
            regex::escape(&self.pattern)
        };
        if self.whole_word {
            pattern = format!(r"\b(?:{pattern})\b");
        }
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(!self.case_sensitive)
            .build()
            .with_context(|| format!("compile judge rule `{}`", self.pattern))?;
        // A rule that can match empty text fails every run, clean ones included.
        let matches_empty = ["", "word .\n"]
            .iter()
            .any(|text| regex.find_iter(text).any(|hit| hit.as_str().is_empty()));
        if matches_empty {
            return Err(anyhow!("judge rule `{}` matches empty output", self.pattern));
        }
        Ok(regex)
    }
}

/// Default table, ordered from most to least specific.
pub fn default_rules() -> Vec<SignalRule> {
    use SignalKind::{GenericError, MissingResource, PermissionDenied, ReadFailure, UncaughtException};
    vec![
        SignalRule::literal(UncaughtException, "Traceback (most recent call last)"),
        SignalRule::literal(ReadFailure, "Failed to read"),
        SignalRule::literal(MissingResource, "No such file or directory"),
        SignalRule::literal(MissingResource, "credentials.json not found"),
        SignalRule::literal(PermissionDenied, "Permission denied"),
        SignalRule::literal(PermissionDenied, "PermissionError"),
        SignalRule::literal(GenericError, "An error occurred:"),
        SignalRule::literal(GenericError, "An unexpected error occurred:"),
        SignalRule::literal(GenericError, "Error:"),
        SignalRule::literal(UncaughtException, "Exception").whole_word(),
        SignalRule::literal(GenericError, "Failure").whole_word(),
        SignalRule::literal(GenericError, "Failed to"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// A rule hit, with the triggering text preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMatch {
    pub kind: SignalKind,
    pub stream: Stream,
    /// Exact substring the rule matched.
    pub matched: String,
    /// Full output line containing the match, trimmed.
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum JudgedFailure {
    Timeout {
        elapsed: Duration,
    },
    Crash {
        code: Option<i32>,
        signal: Option<i32>,
        /// Last non-empty stderr line, if any.
        stderr_tail: Option<String>,
    },
    Signal(SignalMatch),
}

impl JudgedFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            JudgedFailure::Timeout { .. } => FailureKind::TimeoutExceeded,
            JudgedFailure::Crash { .. } => FailureKind::CrashExit,
            JudgedFailure::Signal(_) => FailureKind::OutputErrorSignal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Judgment {
    Passed,
    Failed(JudgedFailure),
}

impl Judgment {
    pub fn effective_success(&self) -> bool {
        matches!(self, Judgment::Passed)
    }

    pub fn failure(&self) -> Option<&JudgedFailure> {
        match self {
            Judgment::Passed => None,
            Judgment::Failed(failure) => Some(failure),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: SignalRule,
    regex: Regex,
}

#[derive(Debug)]
pub struct OutputJudge {
    rules: Vec<CompiledRule>,
}

impl OutputJudge {
    pub fn new(rules: &[SignalRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: rule.compile()?,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn with_default_rules() -> Result<Self> {
        Self::new(&default_rules())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Judge a record. Never mutates it; same input, same output.
    pub fn judge(&self, record: &ExecutionRecord) -> Judgment {
        match record.status {
            ExitStatus::Timeout => {
                return Judgment::Failed(JudgedFailure::Timeout {
                    elapsed: record.duration,
                });
            }
            ExitStatus::Crashed { code, signal } => {
                return Judgment::Failed(JudgedFailure::Crash {
                    code,
                    signal,
                    stderr_tail: last_nonempty_line(&record.stderr).map(str::to_string),
                });
            }
            ExitStatus::Normal => {}
        }

        let streams = [
            (Stream::Stdout, record.stdout.as_str()),
            (Stream::Stderr, record.stderr.as_str()),
        ];
        for compiled in &self.rules {
            for (stream, text) in streams {
                let Some(found) = compiled.regex.find(text) else {
                    continue;
                };
                let hit = SignalMatch {
                    kind: compiled.rule.kind,
                    stream,
                    matched: found.as_str().to_string(),
                    line: line_around(text, found.start(), found.end()).to_string(),
                };
                match compiled.rule.severity {
                    Severity::Advisory => {
                        warn!(
                            kind = hit.kind.as_str(),
                            %stream,
                            line = %hit.line,
                            "advisory output signal"
                        );
                    }
                    Severity::Fatal => {
                        debug!(kind = hit.kind.as_str(), %stream, "output error signal");
                        return Judgment::Failed(JudgedFailure::Signal(hit));
                    }
                }
            }
        }
        Judgment::Passed
    }
}

fn last_nonempty_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

fn line_around(text: &str, start: usize, end: usize) -> &str {
    let line_start = text[..start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = text[end..].find('\n').map_or(text.len(), |i| end + i);
    text[line_start..line_end].trim()
}
