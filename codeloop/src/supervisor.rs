//! Retry supervisor: generate, admit, execute, judge, and retry.
//!
//! Each call to [`Supervisor::run`] services one command to a terminal state
//! inside a bounded loop. Admission rejections and judged execution failures
//! are the same event ([`AttemptFailure`]); either one feeds a narrow
//! diagnostic into the next generation request until the retry ceiling is
//! reached.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{Span, info, instrument, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::admission::{AdmissionGate, AdmissionVerdict};
use crate::core::failure::AttemptFailure;
use crate::core::judge::{Judgment, OutputJudge};
use crate::core::session::{AttemptOutcome, RetrySession, SessionState};
use crate::core::types::{Command, Diagnostic, ExecutionRecord, SessionId};
use crate::io::attempt_log::AttemptLog;
use crate::io::capability::{CapabilitySink, SaveRequest};
use crate::io::config::CodeloopConfig;
use crate::io::generator::{GenerationRequest, Generator};
use crate::io::sandbox::Sandbox;
use crate::report::{SessionOutcome, SessionReport};
use crate::upstream::{Sleeper, UpstreamGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub max_retries: usize,
    pub diagnostic_max_chars: usize,
    pub timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &CodeloopConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            diagnostic_max_chars: config.diagnostic_max_chars,
            timeout: config.execution.timeout(),
        }
    }
}

/// How one attempt ended, before it is written into the session.
enum Step {
    Passed(ExecutionRecord),
    Failed(AttemptFailure, Option<ExecutionRecord>),
    Cancelled,
}

pub struct Supervisor<G, X, C, S> {
    generator: G,
    sandbox: X,
    capabilities: C,
    guard: UpstreamGuard<S>,
    gate: AdmissionGate,
    judge: OutputJudge,
    settings: SupervisorSettings,
    attempt_log: Option<AttemptLog>,
    next_session: u64,
}

impl<G, X, C, S> Supervisor<G, X, C, S>
where
    G: Generator,
    X: Sandbox,
    C: CapabilitySink,
    S: Sleeper,
{
    pub fn new(
        config: &CodeloopConfig,
        generator: G,
        sandbox: X,
        capabilities: C,
        sleeper: S,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            generator,
            sandbox,
            capabilities,
            guard: UpstreamGuard::new(config.upstream.schedule(), sleeper),
            gate: AdmissionGate::new(config.admission.clone()).context("build admission gate")?,
            judge: OutputJudge::new(&config.judge.rules).context("build output judge")?,
            settings: SupervisorSettings::from_config(config),
            attempt_log: None,
            next_session: 1,
        })
    }

    pub fn with_attempt_log(mut self, log: AttemptLog) -> Self {
        self.attempt_log = Some(log);
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Service one command to a terminal state.
    ///
    /// Domain failures (rejections, failed runs, upstream outages) are
    /// reported in the returned [`SessionReport`]; `Err` is reserved for
    /// infrastructure problems such as an interpreter that cannot start.
    #[instrument(skip_all, fields(session_id))]
    pub fn run(&mut self, text: &str, cancel: &CancelToken) -> Result<SessionReport> {
        let session_id = SessionId(self.next_session);
        self.next_session += 1;
        Span::current().record("session_id", session_id.0);
        info!(command = %text, max_retries = self.settings.max_retries, "session started");

        let mut session = RetrySession::new(Command::new(session_id, text), self.settings.max_retries);
        let mut diagnostic: Option<Diagnostic> = None;

        for _ in 0..session.max_attempts() {
            if cancel.is_cancelled() {
                return self.finish(session, SessionState::Cancelled, SessionOutcome::Cancelled);
            }
            let index = session.open_attempt(diagnostic.clone())?;
            info!(attempt = index, retry = diagnostic.is_some(), "generating");

            let request = GenerationRequest {
                command: text.to_string(),
                diagnostic: diagnostic.clone(),
                attempt: index,
                max_attempts: session.max_attempts(),
            };
            let source = match self.guard.generate(&self.generator, &request, cancel) {
                Ok(source) => source,
                Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                    info!(attempt = index, "generation cancelled");
                    session.record_outcome(index, AttemptOutcome::Cancelled)?;
                    self.log_attempt(&session, index, None);
                    return self.finish(session, SessionState::Cancelled, SessionOutcome::Cancelled);
                }
                Err(err) => {
                    warn!(attempt = index, error = %err, "generation unavailable");
                    session.record_outcome(
                        index,
                        AttemptOutcome::GenerationFailed {
                            reason: err.to_string(),
                        },
                    )?;
                    self.log_attempt(&session, index, None);
                    return self.finish(
                        session,
                        SessionState::UpstreamUnavailable,
                        SessionOutcome::UpstreamUnavailable {
                            error: err.to_string(),
                        },
                    );
                }
            };
            session.set_source(index, source.clone())?;

            match self.attempt(&source, cancel)? {
                Step::Passed(record) => {
                    info!(attempt = index, "attempt succeeded");
                    session.record_outcome(index, AttemptOutcome::Succeeded)?;
                    self.log_attempt(&session, index, Some(&record));
                    self.capabilities.save(SaveRequest::new(text, &source));
                    return self.finish(
                        session,
                        SessionState::Succeeded,
                        SessionOutcome::Succeeded {
                            stdout: record.stdout,
                            stderr: record.stderr,
                        },
                    );
                }
                Step::Failed(failure, record) => {
                    let next = failure.diagnostic(self.settings.diagnostic_max_chars);
                    warn!(attempt = index, kind = %next.kind, diagnostic = %next.text, "attempt failed");
                    session.record_outcome(index, failure.into())?;
                    self.log_attempt(&session, index, record.as_ref());
                    diagnostic = Some(next);
                }
                Step::Cancelled => {
                    session.record_outcome(index, AttemptOutcome::Cancelled)?;
                    self.log_attempt(&session, index, None);
                    return self.finish(session, SessionState::Cancelled, SessionOutcome::Cancelled);
                }
            }
        }

        let diagnostic = diagnostic.ok_or_else(|| anyhow!("session ended without a failure"))?;
        warn!(attempts = session.attempts().len(), "retry ceiling reached");
        self.finish(
            session,
            SessionState::Exhausted,
            SessionOutcome::Exhausted { diagnostic },
        )
    }

    /// Admit, execute, and judge one source. The sandbox is only reached
    /// for admitted source.
    fn attempt(&self, source: &str, cancel: &CancelToken) -> Result<Step> {
        if let AdmissionVerdict::Rejected(rejection) = self.gate.admit(source) {
            return Ok(Step::Failed(AttemptFailure::Rejected(rejection), None));
        }
        if cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        let record = match self.sandbox.run(source, self.settings.timeout, cancel) {
            Ok(record) => record,
            Err(err) if err.downcast_ref::<Cancelled>().is_some() => return Ok(Step::Cancelled),
            Err(err) => return Err(err).context("execute admitted source"),
        };
        Ok(match self.judge.judge(&record) {
            Judgment::Passed => Step::Passed(record),
            Judgment::Failed(failure) => Step::Failed(AttemptFailure::Judged(failure), Some(record)),
        })
    }

    fn finish(
        &self,
        mut session: RetrySession,
        state: SessionState,
        outcome: SessionOutcome,
    ) -> Result<SessionReport> {
        session.finish(state)?;
        info!(?state, attempts = session.attempts().len(), "session finished");
        Ok(SessionReport {
            session_id: session.command().session_id(),
            command: session.command().text().to_string(),
            max_retries: session.max_retries(),
            outcome,
            attempts: session.attempts().to_vec(),
        })
    }

    fn log_attempt(&self, session: &RetrySession, index: usize, record: Option<&ExecutionRecord>) {
        let Some(log) = &self.attempt_log else {
            return;
        };
        let Some(attempt) = session.attempts().get(index) else {
            return;
        };
        let command = session.command();
        if let Err(err) = log.write(command.session_id(), command.text(), attempt, record) {
            warn!(err = %format!("{err:#}"), attempt = index, "failed to write attempt log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::test_support::{
        RecordingCapabilitySink, RecordingSleeper, ScriptedGenerator, ScriptedSandbox, generated,
        signal_record,
    };

    #[test]
    fn rejected_source_never_reaches_sandbox() {
        let generator = ScriptedGenerator::new(vec![
            generated("def broken(:\n    pass\n"),
            generated("print('ok')\n"),
        ]);
        let sandbox = ScriptedSandbox::new(vec![ExecutionRecord::normal("ok\n", "")]);
        let sink = RecordingCapabilitySink::default();
        let sleeper = RecordingSleeper::default();
        let mut supervisor = Supervisor::new(
            &CodeloopConfig::default(),
            &generator,
            &sandbox,
            &sink,
            &sleeper,
        )
        .expect("supervisor");

        let report = supervisor.run("say ok", &CancelToken::new()).expect("run");

        assert!(report.is_success());
        assert_eq!(sandbox.calls(), 1);
        assert_eq!(sandbox.sources(), vec!["print('ok')\n".to_string()]);
        let requests = generator.requests();
        let diagnostic = requests[1].diagnostic.as_ref().expect("diagnostic");
        assert_eq!(diagnostic.kind, FailureKind::SyntaxInvalid);
        assert!(diagnostic.text.starts_with("syntax error at line 1"));
    }

    #[test]
    fn session_ids_are_monotonic() {
        let generator = ScriptedGenerator::new(vec![generated("print(1)\n"), generated("print(2)\n")]);
        let sandbox = ScriptedSandbox::new(vec![
            ExecutionRecord::normal("1\n", ""),
            ExecutionRecord::normal("2\n", ""),
        ]);
        let sink = RecordingCapabilitySink::default();
        let mut supervisor = Supervisor::new(
            &CodeloopConfig::default(),
            &generator,
            &sandbox,
            &sink,
            RecordingSleeper::default(),
        )
        .expect("supervisor");

        let first = supervisor.run("one", &CancelToken::new()).expect("first");
        let second = supervisor.run("two", &CancelToken::new()).expect("second");
        assert_eq!(first.session_id, SessionId(1));
        assert_eq!(second.session_id, SessionId(2));
        assert_eq!(sink.saved().len(), 2);
    }

    #[test]
    fn attempt_log_records_every_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new(vec![
            generated("print('Failed to read a.png')\n"),
            generated("print('done')\n"),
        ]);
        let sandbox = ScriptedSandbox::new(vec![
            signal_record("Failed to read a.png\n"),
            ExecutionRecord::normal("done\n", ""),
        ]);
        let sink = RecordingCapabilitySink::default();
        let mut supervisor = Supervisor::new(
            &CodeloopConfig::default(),
            &generator,
            &sandbox,
            &sink,
            RecordingSleeper::default(),
        )
        .expect("supervisor")
        .with_attempt_log(AttemptLog::at(temp.path().to_path_buf()));

        let report = supervisor.run("open a.png", &CancelToken::new()).expect("run");

        assert!(report.is_success());
        let first = temp.path().join("1").join("0");
        let second = temp.path().join("1").join("1");
        assert_eq!(
            std::fs::read_to_string(first.join("stdout.log")).expect("stdout"),
            "Failed to read a.png\n"
        );
        assert!(second.join("meta.json").is_file());
        assert!(second.join("source.py").is_file());
    }
}
