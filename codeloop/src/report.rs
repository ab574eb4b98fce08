//! User-visible session reports.

use serde::Serialize;

use crate::core::session::Attempt;
use crate::core::types::{Diagnostic, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded { stdout: String, stderr: String },
    /// Retry ceiling reached; carries the most recent failure.
    Exhausted { diagnostic: Diagnostic },
    UpstreamUnavailable { error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub command: String,
    pub max_retries: usize,
    pub outcome: SessionOutcome,
    pub attempts: Vec<Attempt>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Succeeded { .. })
    }

    /// Source of the attempt that succeeded.
    pub fn successful_source(&self) -> Option<&str> {
        if !self.is_success() {
            return None;
        }
        self.attempts.last().and_then(|attempt| attempt.source.as_deref())
    }

    /// Render the report for a human.
    pub fn render(&self) -> String {
        let attempts = self.attempts.len();
        let plural = if attempts == 1 { "" } else { "s" };
        match &self.outcome {
            SessionOutcome::Succeeded { stdout, .. } => {
                let mut out = format!("Succeeded after {attempts} attempt{plural}.");
                let stdout = stdout.trim_end();
                if !stdout.is_empty() {
                    out.push_str("\n\n");
                    out.push_str(stdout);
                }
                out
            }
            SessionOutcome::Exhausted { diagnostic } => format!(
                "Retry ceiling reached: {attempts} attempt{plural} failed (max_retries = {}).\nLast failure ({}): {}",
                self.max_retries, diagnostic.kind, diagnostic.text
            ),
            SessionOutcome::UpstreamUnavailable { error } => {
                format!("Code generation unavailable after {attempts} attempt{plural}: {error}")
            }
            SessionOutcome::Cancelled => format!("Cancelled after {attempts} attempt{plural}."),
        }
    }
}
