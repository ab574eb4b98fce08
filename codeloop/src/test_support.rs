//! Scripted collaborators for exercising the supervisor without processes,
//! models, or real sleeps.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::types::{ExecutionRecord, ExitStatus};
use crate::io::capability::{CapabilitySink, SaveRequest};
use crate::io::generator::{GenerationRequest, Generator, UpstreamError};
use crate::io::sandbox::Sandbox;
use crate::upstream::Sleeper;

/// Successful generation response.
pub fn generated(source: &str) -> Result<String, UpstreamError> {
    Ok(source.to_string())
}

/// Rate-limit style generation failure.
pub fn rate_limited() -> Result<String, UpstreamError> {
    Err(UpstreamError::Transient(
        "429 RESOURCE_EXHAUSTED: quota exceeded".to_string(),
    ))
}

/// Generation interrupted by the user; the scripted generator also fires
/// the session's cancel token.
pub fn interrupted() -> Result<String, UpstreamError> {
    Err(UpstreamError::Cancelled)
}

/// Normal exit whose stdout narrates a failure.
pub fn signal_record(stdout: &str) -> ExecutionRecord {
    ExecutionRecord::normal(stdout, "")
}

pub fn crash_record(code: i32, stderr: &str) -> ExecutionRecord {
    ExecutionRecord::normal("", stderr).with_status(ExitStatus::Crashed {
        code: Some(code),
        signal: None,
    })
}

pub fn timeout_record(stdout: &str, elapsed: Duration) -> ExecutionRecord {
    ExecutionRecord::normal(stdout, "")
        .with_status(ExitStatus::Timeout)
        .with_duration(elapsed)
}

/// Generator that replays a fixed list of responses and records requests.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: RefCell<VecDeque<Result<String, UpstreamError>>>,
    requests: RefCell<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, UpstreamError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Number of generation calls, including upstream retries.
    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.borrow().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<String, UpstreamError> {
        self.requests.borrow_mut().push(request.clone());
        let response = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamError::Fatal("script exhausted".to_string())));
        if matches!(response, Err(UpstreamError::Cancelled)) {
            cancel.cancel();
        }
        response
    }
}

/// A scripted sandbox step: a record to return, or cancellation mid-run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Record(ExecutionRecord),
    Cancel,
}

/// Sandbox that replays records and counts invocations.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    runs: RefCell<VecDeque<ScriptedRun>>,
    sources: RefCell<Vec<String>>,
    calls: Cell<usize>,
}

impl ScriptedSandbox {
    pub fn new(records: Vec<ExecutionRecord>) -> Self {
        Self::with_runs(records.into_iter().map(ScriptedRun::Record).collect())
    }

    pub fn with_runs(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            sources: RefCell::new(Vec::new()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.borrow().clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(&self, source: &str, _timeout: Duration, cancel: &CancelToken) -> Result<ExecutionRecord> {
        self.calls.set(self.calls.get() + 1);
        self.sources.borrow_mut().push(source.to_string());
        match self.runs.borrow_mut().pop_front() {
            Some(ScriptedRun::Record(record)) => Ok(record),
            Some(ScriptedRun::Cancel) => {
                cancel.cancel();
                Err(Cancelled.into())
            }
            None => Err(anyhow!("no scripted execution record left")),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, _cancel: &CancelToken) {
        self.slept.borrow_mut().push(duration);
    }
}

#[derive(Debug, Default)]
pub struct RecordingCapabilitySink {
    saved: RefCell<Vec<SaveRequest>>,
}

impl RecordingCapabilitySink {
    pub fn saved(&self) -> Vec<SaveRequest> {
        self.saved.borrow().clone()
    }
}

impl CapabilitySink for RecordingCapabilitySink {
    fn save(&self, request: SaveRequest) {
        self.saved.borrow_mut().push(request);
    }
}
