//! Code generation boundary.
//!
//! The [`Generator`] trait is the only way the supervisor obtains source
//! text. [`CommandGenerator`] shells out to a configured model CLI; tests use
//! scripted generators instead.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::types::Diagnostic;
use crate::io::config::{GeneratorConfig, UpstreamConfig};
use crate::io::process::{ResourceLimits, contain, run_command_with_timeout};
use crate::io::prompt::PromptEngine;

/// Parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub command: String,
    /// Narrow failure detail from the previous attempt.
    pub diagnostic: Option<Diagnostic>,
    /// 0-based attempt index within the session.
    pub attempt: usize,
    pub max_attempts: usize,
}

/// Failure reported by the generation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Rate limits, overload, timeouts: worth retrying after a delay.
    Transient(String),
    /// Anything retrying will not fix.
    Fatal(String),
    /// The session was interrupted while waiting on the service.
    Cancelled,
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Transient(msg) => write!(f, "transient upstream error: {msg}"),
            UpstreamError::Fatal(msg) => write!(f, "upstream error: {msg}"),
            UpstreamError::Cancelled => f.write_str("generation cancelled"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Abstraction over code generation backends.
///
/// Implementations should stop early and return [`UpstreamError::Cancelled`]
/// once `cancel` fires.
pub trait Generator {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<String, UpstreamError>;
}

impl<T: Generator + ?Sized> Generator for &T {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<String, UpstreamError> {
        (**self).generate(request, cancel)
    }
}

/// Generator that pipes a rendered prompt into an external command.
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    transient_markers: Vec<String>,
    prompts: PromptEngine,
}

impl CommandGenerator {
    pub fn from_config(generator: &GeneratorConfig, upstream: &UpstreamConfig) -> Self {
        Self {
            command: generator.command.clone(),
            timeout: Duration::from_secs(generator.timeout_secs),
            output_limit_bytes: generator.output_limit_bytes,
            transient_markers: upstream
                .transient_markers
                .iter()
                .map(|marker| marker.to_lowercase())
                .collect(),
            prompts: PromptEngine::new(),
        }
    }

    fn is_transient(&self, stderr: &str) -> bool {
        let stderr = stderr.to_lowercase();
        self.transient_markers
            .iter()
            .any(|marker| stderr.contains(marker.as_str()))
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(attempt = request.attempt, retry = request.diagnostic.is_some()))]
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<String, UpstreamError> {
        let prompt = self
            .prompts
            .render(request)
            .map_err(|e| UpstreamError::Fatal(format!("render prompt: {e:#}")))?;
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| UpstreamError::Fatal("generator command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        // Own process group, so a timeout or cancel takes helpers down too.
        contain(&mut cmd, ResourceLimits::default());

        info!(generator = %program, prompt_bytes = prompt.len(), "requesting generation");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            cancel,
        )
        .map_err(|e| {
            if e.downcast_ref::<Cancelled>().is_some() {
                UpstreamError::Cancelled
            } else {
                UpstreamError::Fatal(format!("{e:#}"))
            }
        })?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
            return Err(UpstreamError::Transient(format!(
                "generator timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = stderr
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .unwrap_or("no stderr output");
            let message = format!(
                "generator exited with status {:?}: {detail}",
                output.status.code()
            );
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(if self.is_transient(&stderr) {
                UpstreamError::Transient(message)
            } else {
                UpstreamError::Fatal(message)
            });
        }

        let response = String::from_utf8_lossy(&output.stdout);
        let code = extract_code(&response);
        debug!(response_bytes = response.len(), code_bytes = code.len(), "generation complete");
        Ok(code)
    }
}

/// Pull program text out of a model response.
///
/// Prefers the first fenced block tagged as Python, then the first fenced
/// block of any kind, then the whole response.
pub fn extract_code(response: &str) -> String {
    let mut blocks: Vec<(String, Vec<&str>)> = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in response.lines() {
        let fence = line.trim_start().strip_prefix("```");
        open = match (open, fence) {
            (None, Some(info)) => Some((info.trim().to_ascii_lowercase(), Vec::new())),
            (Some(block), Some(rest)) if rest.trim().is_empty() => {
                blocks.push(block);
                None
            }
            (Some((lang, mut body)), _) => {
                body.push(line);
                Some((lang, body))
            }
            (None, None) => None,
        };
    }
    // Unterminated fence: take what was produced.
    if let Some(block) = open {
        blocks.push(block);
    }

    let chosen = blocks
        .iter()
        .find(|(lang, _)| matches!(lang.as_str(), "python" | "py" | "python3"))
        .or_else(|| blocks.first());
    match chosen {
        Some((_, body)) => {
            let mut code = body.join("\n");
            code.push('\n');
            code
        }
        None => response.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_block() {
        let response = "Here you go:\n\n```python\nimport os\nprint('hi')\n```\n\nEnjoy.";
        assert_eq!(extract_code(response), "import os\nprint('hi')\n");
    }

    #[test]
    fn prefers_python_block_over_earlier_blocks() {
        let response = "```bash\npip install pyautogui\n```\n```py\nimport pyautogui\n```\n";
        assert_eq!(extract_code(response), "import pyautogui\n");
    }

    #[test]
    fn falls_back_to_untagged_block() {
        assert_eq!(extract_code("```\nprint(1)\n```"), "print(1)\n");
    }

    #[test]
    fn unfenced_response_is_used_verbatim() {
        assert_eq!(extract_code("\nprint(1)\n\n"), "print(1)");
    }

    #[test]
    fn unterminated_fence_keeps_body() {
        assert_eq!(extract_code("```python\nprint(1)"), "print(1)\n");
    }

    #[cfg(unix)]
    fn generator(script: &str) -> CommandGenerator {
        let generator = GeneratorConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 10,
            output_limit_bytes: 10_000,
        };
        CommandGenerator::from_config(&generator, &UpstreamConfig::default())
    }

    #[cfg(unix)]
    fn request() -> GenerationRequest {
        GenerationRequest {
            command: "say hi".to_string(),
            diagnostic: None,
            attempt: 0,
            max_attempts: 3,
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_reads_stdout() {
        let generator = generator("cat > /dev/null; printf '```python\\nprint(\"hi\")\\n```\\n'");
        assert_eq!(
            generator
                .generate(&request(), &CancelToken::new())
                .expect("generate"),
            "print(\"hi\")\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn rate_limit_is_transient() {
        let generator = generator("cat > /dev/null; echo '429 Too Many Requests' >&2; exit 1");
        let err = generator
            .generate(&request(), &CancelToken::new())
            .expect_err("fails");
        assert!(err.is_transient(), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn other_failures_are_fatal() {
        let generator = generator("cat > /dev/null; echo 'invalid api key' >&2; exit 1");
        let err = generator
            .generate(&request(), &CancelToken::new())
            .expect_err("fails");
        assert_eq!(
            err,
            UpstreamError::Fatal("generator exited with status Some(1): invalid api key".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn cancel_stops_a_slow_generator() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = generator("cat > /dev/null; sleep 30")
            .generate(&request(), &cancel)
            .expect_err("cancelled");
        canceller.join().expect("join");

        assert_eq!(err, UpstreamError::Cancelled);
        assert!(!err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
