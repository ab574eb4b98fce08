//! Retry session state owned by one in-flight supervisor run.
//!
//! The session enforces the structural invariants of the loop: attempts are
//! sequential, at most `max_retries + 1` exist, and an attempt's outcome is
//! written exactly once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::admission::Rejection;
use crate::core::failure::AttemptFailure;
use crate::core::judge::JudgedFailure;
use crate::core::types::{Command, Diagnostic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    /// Admission refused the source; it was never executed.
    Rejected(Rejection),
    /// The source ran and the judge found it failed.
    ExecutionFailed(JudgedFailure),
    Succeeded,
    /// No source was obtained because the upstream service was unavailable.
    GenerationFailed { reason: String },
    /// The session was cancelled while this attempt was in flight.
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, AttemptOutcome::Pending)
    }

    pub fn failure(&self) -> Option<AttemptFailure> {
        match self {
            AttemptOutcome::Rejected(rejection) => Some(AttemptFailure::Rejected(rejection.clone())),
            AttemptOutcome::ExecutionFailed(failure) => Some(AttemptFailure::Judged(failure.clone())),
            _ => None,
        }
    }
}

impl From<AttemptFailure> for AttemptOutcome {
    fn from(failure: AttemptFailure) -> Self {
        match failure {
            AttemptFailure::Rejected(rejection) => AttemptOutcome::Rejected(rejection),
            AttemptFailure::Judged(failure) => AttemptOutcome::ExecutionFailed(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 0-based position in the session.
    pub index: usize,
    /// Detail fed into generation; `None` for the first attempt.
    pub diagnostic: Option<Diagnostic>,
    pub source: Option<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Succeeded,
    /// The retry ceiling was reached without success.
    Exhausted,
    UpstreamUnavailable,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Active)
    }
}

/// Misuse of the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    CeilingReached { max_attempts: usize },
    AttemptInFlight { index: usize },
    NotActive { state: SessionState },
    UnknownAttempt { index: usize },
    OutcomeAlreadyRecorded { index: usize },
    SourceAlreadySet { index: usize },
    PendingOutcome { index: usize },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::CeilingReached { max_attempts } => {
                write!(f, "retry ceiling reached ({max_attempts} attempts)")
            }
            SessionError::AttemptInFlight { index } => {
                write!(f, "attempt {index} is still pending")
            }
            SessionError::NotActive { state } => write!(f, "session is no longer active ({state:?})"),
            SessionError::UnknownAttempt { index } => write!(f, "attempt {index} does not exist"),
            SessionError::OutcomeAlreadyRecorded { index } => {
                write!(f, "attempt {index} already has an outcome")
            }
            SessionError::SourceAlreadySet { index } => {
                write!(f, "attempt {index} already has source text")
            }
            SessionError::PendingOutcome { index } => {
                write!(f, "attempt {index} cannot be recorded as pending")
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone)]
pub struct RetrySession {
    command: Command,
    max_retries: usize,
    attempts: Vec<Attempt>,
    state: SessionState,
}

impl RetrySession {
    pub fn new(command: Command, max_retries: usize) -> Self {
        Self {
            command,
            max_retries,
            attempts: Vec::new(),
            state: SessionState::Active,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Open the next attempt. Fails once the ceiling is reached.
    pub fn open_attempt(&mut self, diagnostic: Option<Diagnostic>) -> Result<usize, SessionError> {
        self.ensure_active()?;
        self.ensure_idle()?;
        if self.attempts.len() >= self.max_attempts() {
            return Err(SessionError::CeilingReached {
                max_attempts: self.max_attempts(),
            });
        }
        let index = self.attempts.len();
        self.attempts.push(Attempt {
            index,
            diagnostic,
            source: None,
            outcome: AttemptOutcome::Pending,
        });
        Ok(index)
    }

    pub fn set_source(&mut self, index: usize, source: String) -> Result<(), SessionError> {
        let attempt = self
            .attempts
            .get_mut(index)
            .ok_or(SessionError::UnknownAttempt { index })?;
        if attempt.source.is_some() {
            return Err(SessionError::SourceAlreadySet { index });
        }
        attempt.source = Some(source);
        Ok(())
    }

    /// Record the outcome of an attempt. Outcomes are write-once.
    pub fn record_outcome(
        &mut self,
        index: usize,
        outcome: AttemptOutcome,
    ) -> Result<(), SessionError> {
        if outcome.is_pending() {
            return Err(SessionError::PendingOutcome { index });
        }
        let attempt = self
            .attempts
            .get_mut(index)
            .ok_or(SessionError::UnknownAttempt { index })?;
        if !attempt.outcome.is_pending() {
            return Err(SessionError::OutcomeAlreadyRecorded { index });
        }
        attempt.outcome = outcome;
        Ok(())
    }

    pub fn finish(&mut self, state: SessionState) -> Result<(), SessionError> {
        self.ensure_active()?;
        if !state.is_terminal() {
            return Err(SessionError::NotActive { state });
        }
        self.ensure_idle()?;
        self.state = state;
        Ok(())
    }

    /// Most recent recorded failure, if any.
    pub fn last_failure(&self) -> Option<AttemptFailure> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.outcome.failure())
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::NotActive { state: self.state });
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match self.attempts.last() {
            Some(attempt) if attempt.outcome.is_pending() => Err(SessionError::AttemptInFlight {
                index: attempt.index,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureKind, SessionId};

    fn session(max_retries: usize) -> RetrySession {
        RetrySession::new(Command::new(SessionId(1), "open notepad"), max_retries)
    }

    fn crash() -> AttemptOutcome {
        AttemptOutcome::ExecutionFailed(JudgedFailure::Crash {
            code: Some(1),
            signal: None,
            stderr_tail: None,
        })
    }

    #[test]
    fn ceiling_is_structural() {
        let mut session = session(2);
        for expected in 0..3 {
            let index = session.open_attempt(None).expect("open");
            assert_eq!(index, expected);
            session.record_outcome(index, crash()).expect("record");
        }
        assert_eq!(
            session.open_attempt(None),
            Err(SessionError::CeilingReached { max_attempts: 3 })
        );
        assert_eq!(session.attempts().len(), 3);
    }

    #[test]
    fn only_one_attempt_in_flight() {
        let mut session = session(2);
        session.open_attempt(None).expect("open");
        assert_eq!(
            session.open_attempt(None),
            Err(SessionError::AttemptInFlight { index: 0 })
        );
    }

    #[test]
    fn outcome_is_write_once() {
        let mut session = session(0);
        let index = session.open_attempt(None).expect("open");
        session
            .record_outcome(index, AttemptOutcome::Succeeded)
            .expect("record");
        assert_eq!(
            session.record_outcome(index, crash()),
            Err(SessionError::OutcomeAlreadyRecorded { index })
        );
        assert_eq!(
            session.attempts()[0].outcome,
            AttemptOutcome::Succeeded
        );
    }

    #[test]
    fn source_is_write_once() {
        let mut session = session(0);
        let index = session.open_attempt(None).expect("open");
        session.set_source(index, "print(1)".to_string()).expect("set");
        assert_eq!(
            session.set_source(index, "print(2)".to_string()),
            Err(SessionError::SourceAlreadySet { index })
        );
    }

    #[test]
    fn finish_requires_settled_attempts() {
        let mut session = session(1);
        let index = session.open_attempt(None).expect("open");
        assert_eq!(
            session.finish(SessionState::Succeeded),
            Err(SessionError::AttemptInFlight { index })
        );
        session
            .record_outcome(index, AttemptOutcome::Succeeded)
            .expect("record");
        session.finish(SessionState::Succeeded).expect("finish");
        assert_eq!(
            session.open_attempt(None),
            Err(SessionError::NotActive {
                state: SessionState::Succeeded
            })
        );
    }

    #[test]
    fn last_failure_skips_non_failures() {
        let mut session = session(2);
        let first = session.open_attempt(None).expect("open");
        session.record_outcome(first, crash()).expect("record");
        let second = session.open_attempt(None).expect("open");
        session
            .record_outcome(
                second,
                AttemptOutcome::GenerationFailed {
                    reason: "quota".to_string(),
                },
            )
            .expect("record");
        let failure = session.last_failure().expect("failure");
        assert_eq!(failure.kind(), FailureKind::CrashExit);
    }
}
