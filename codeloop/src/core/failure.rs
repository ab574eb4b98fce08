//! One failure event for every way an attempt can go wrong before success.
//!
//! Admission rejections and judged execution failures flow into the
//! supervisor through the same type, and both reduce to a narrow
//! [`Diagnostic`] for the next generation request.

use serde::{Deserialize, Serialize};

use crate::core::admission::Rejection;
use crate::core::judge::JudgedFailure;
use crate::core::types::{Diagnostic, FailureKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AttemptFailure {
    Rejected(Rejection),
    Judged(JudgedFailure),
}

impl AttemptFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            AttemptFailure::Rejected(rejection) => rejection.failure_kind(),
            AttemptFailure::Judged(failure) => failure.kind(),
        }
    }

    /// Reduce the failure to the one detail worth feeding back.
    pub fn diagnostic(&self, max_chars: usize) -> Diagnostic {
        let text = match self {
            AttemptFailure::Rejected(rejection) => rejection.to_string(),
            AttemptFailure::Judged(JudgedFailure::Timeout { elapsed }) => format!(
                "execution exceeded the {}s timeout and was killed",
                elapsed.as_secs()
            ),
            AttemptFailure::Judged(JudgedFailure::Crash {
                code,
                signal,
                stderr_tail,
            }) => {
                let exit = match (code, signal) {
                    (_, Some(signal)) => format!("process killed by signal {signal}"),
                    (Some(code), None) => format!("process exited with code {code}"),
                    (None, None) => "process exited abnormally".to_string(),
                };
                match stderr_tail {
                    Some(tail) => format!("{exit}: {tail}"),
                    None => exit,
                }
            }
            AttemptFailure::Judged(JudgedFailure::Signal(hit)) => hit.line.clone(),
        };
        Diagnostic {
            kind: self.kind(),
            text: truncate_chars(&text, max_chars),
        }
    }
}

/// Truncate on a char boundary, marking the cut with `...`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::admission::{Location, RejectionKind};
    use crate::core::judge::{SignalKind, SignalMatch, Stream};

    #[test]
    fn syntax_diagnostic_keeps_location() {
        let failure = AttemptFailure::Rejected(Rejection {
            kind: RejectionKind::SyntaxInvalid,
            location: Some(Location { line: 3, column: 9 }),
            reason: "unexpected `)`".to_string(),
        });
        let diagnostic = failure.diagnostic(500);
        assert_eq!(diagnostic.kind, FailureKind::SyntaxInvalid);
        assert_eq!(
            diagnostic.text,
            "syntax error at line 3, column 9: unexpected `)`"
        );
    }

    #[test]
    fn signal_diagnostic_is_the_matched_line() {
        let failure = AttemptFailure::Judged(JudgedFailure::Signal(SignalMatch {
            kind: SignalKind::ReadFailure,
            stream: Stream::Stdout,
            matched: "Failed to read".to_string(),
            line: "Failed to read paint_line_tool.png".to_string(),
        }));
        let diagnostic = failure.diagnostic(500);
        assert_eq!(diagnostic.kind, FailureKind::OutputErrorSignal);
        assert_eq!(diagnostic.text, "Failed to read paint_line_tool.png");
    }

    #[test]
    fn crash_diagnostic_names_exit_and_tail() {
        let failure = AttemptFailure::Judged(JudgedFailure::Crash {
            code: Some(2),
            signal: None,
            stderr_tail: Some("KeyError: 'x'".to_string()),
        });
        assert_eq!(
            failure.diagnostic(500).text,
            "process exited with code 2: KeyError: 'x'"
        );
        let killed = AttemptFailure::Judged(JudgedFailure::Crash {
            code: None,
            signal: Some(9),
            stderr_tail: None,
        });
        assert_eq!(killed.diagnostic(500).text, "process killed by signal 9");
    }

    #[test]
    fn timeout_diagnostic_names_limit() {
        let failure = AttemptFailure::Judged(JudgedFailure::Timeout {
            elapsed: Duration::from_secs(120),
        });
        let diagnostic = failure.diagnostic(500);
        assert_eq!(diagnostic.kind, FailureKind::TimeoutExceeded);
        assert!(diagnostic.text.contains("120s timeout"));
    }

    #[test]
    fn diagnostics_are_truncated() {
        let failure = AttemptFailure::Rejected(Rejection {
            kind: RejectionKind::PolicyViolation,
            location: None,
            reason: "é".repeat(100),
        });
        let diagnostic = failure.diagnostic(20);
        assert_eq!(diagnostic.text.chars().count(), 20);
        assert!(diagnostic.text.ends_with("..."));
    }
}
