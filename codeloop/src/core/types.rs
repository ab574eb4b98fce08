//! Shared deterministic types for the supervision pipeline.
//!
//! These types are the contracts between the admission gate, the sandboxed
//! executor, the output judge, and the retry supervisor. They carry no I/O and
//! serialize in a stable shape so attempt logs stay diffable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Monotonic identifier assigned by a supervisor to each session it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural-language command being serviced. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    session_id: SessionId,
    text: String,
}

impl Command {
    pub fn new(session_id: SessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            text: text.into(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Failure taxonomy shared by every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Source did not parse.
    SyntaxInvalid,
    /// Source parsed but broke the admission policy.
    PolicyViolation,
    /// Program ran past the wall-clock limit and was killed.
    TimeoutExceeded,
    /// Program exited non-zero or was killed by a signal.
    CrashExit,
    /// Program exited normally but its output narrated a failure.
    OutputErrorSignal,
    /// Generation service failed in a way worth retrying.
    UpstreamTransient,
    /// Generation service stayed unavailable after the guard's budget.
    UpstreamExhausted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::SyntaxInvalid => "syntax_invalid",
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::CrashExit => "crash_exit",
            FailureKind::OutputErrorSignal => "output_error_signal",
            FailureKind::UpstreamTransient => "upstream_transient",
            FailureKind::UpstreamExhausted => "upstream_exhausted",
        }
    }

    /// Whether the retry supervisor may regenerate code after this failure.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            FailureKind::UpstreamTransient | FailureKind::UpstreamExhausted
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a sandboxed program terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exit code 0.
    Normal,
    /// Non-zero exit code or termination by signal.
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Killed after exceeding the wall-clock limit.
    Timeout,
}

impl ExitStatus {
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitStatus::Normal)
    }
}

/// Everything observed from one sandboxed run. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Bytes of stdout discarded beyond the capture limit.
    pub stdout_truncated: usize,
    /// Bytes of stderr discarded beyond the capture limit.
    pub stderr_truncated: usize,
}

impl ExecutionRecord {
    /// Record for a run that exited normally with the given output.
    pub fn normal(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Normal,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
            stdout_truncated: 0,
            stderr_truncated: 0,
        }
    }

    pub fn with_status(mut self, status: ExitStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Narrowly scoped failure detail fed back into regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: FailureKind,
    pub text: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_kinds_are_not_recoverable() {
        assert!(FailureKind::SyntaxInvalid.is_recoverable());
        assert!(FailureKind::OutputErrorSignal.is_recoverable());
        assert!(!FailureKind::UpstreamTransient.is_recoverable());
        assert!(!FailureKind::UpstreamExhausted.is_recoverable());
    }

    #[test]
    fn exit_status_serializes_with_kind_tag() {
        let json = serde_json::to_string(&ExitStatus::Crashed {
            code: Some(1),
            signal: None,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"kind":"crashed","code":1,"signal":null}"#);
        assert_eq!(
            serde_json::to_string(&ExitStatus::Timeout).expect("serialize"),
            r#"{"kind":"timeout"}"#
        );
    }

    #[test]
    fn command_keeps_session_id_and_text() {
        let command = Command::new(SessionId(7), "open notepad");
        assert_eq!(command.session_id(), SessionId(7));
        assert_eq!(command.text(), "open notepad");
    }
}
