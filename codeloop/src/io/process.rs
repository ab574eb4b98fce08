//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{CancelToken, Cancelled};

/// How often a waiting parent re-checks its cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output readers may keep draining after the child is reaped.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Signal that terminated the child, if any.
    pub fn signal(&self) -> Option<i32> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            self.status.signal()
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// Resource ceilings applied to the child before it execs. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_secs: u64,
    pub max_processes: u64,
}

/// Put the child in its own process group and apply `limits` inside it.
///
/// On non-Unix targets this is a no-op; containment is then limited to the
/// wall-clock timeout.
#[allow(unsafe_code)]
pub fn contain(cmd: &mut Command, limits: ResourceLimits) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        cmd.process_group(0);
        // SAFETY: the closure only calls async-signal-safe `setrlimit` and
        // allocates nothing.
        unsafe {
            cmd.pre_exec(move || apply_limits(limits));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (cmd, limits);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn apply_limits(limits: ResourceLimits) -> std::io::Result<()> {
    fn rlimit(value: u64) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        }
    }

    // SAFETY: setrlimit reads a valid, stack-allocated struct.
    unsafe {
        if libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0)) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if limits.memory_bytes > 0 && libc::setrlimit(libc::RLIMIT_AS, &rlimit(limits.memory_bytes)) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if limits.cpu_secs > 0 && libc::setrlimit(libc::RLIMIT_CPU, &rlimit(limits.cpu_secs)) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if limits.max_processes > 0
            && libc::setrlimit(libc::RLIMIT_NPROC, &rlimit(limits.max_processes)) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Forcibly stop the child and everything in its process group.
#[allow(unsafe_code)]
fn kill_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(child.id()).context("child pid out of range")?;
        // SAFETY: signalling a process group we created; no memory is touched.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        warn!(
            err = %std::io::Error::last_os_error(),
            "failed to kill process group, killing child only"
        );
    }
    child.kill().context("kill command")
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// If `cancel` fires while waiting, the child's process group is killed and a [`Cancelled`]
/// error is returned.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // A child that never reads stdin must not block the timeout loop. A
        // child that exits without reading closes the pipe; that is the
        // child's business, not a spawn failure.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
            kill_tree(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break status;
        }
    };
    let elapsed = started.elapsed();

    drain_readers(&done_rx, 2, DRAIN_GRACE)?;
    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

    if cancelled {
        return Err(Cancelled.into());
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// Bytes kept from one output stream plus the count of bytes discarded.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let shared = Arc::clone(&capture);
    thread::spawn(move || {
        let result = read_stream_limited(reader, limit, &shared);
        // The receiver is gone once the parent stopped waiting for us.
        let _ = done.send(result);
    });
    capture
}

/// Wait for `readers` completion messages, giving up after `grace`.
///
/// A descendant that left the process group (for example via `setsid`) keeps
/// the pipes open after the child is reaped. Its readers are abandoned and
/// whatever they captured so far is kept.
fn drain_readers(done: &mpsc::Receiver<Result<()>>, readers: usize, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    for finished in 0..readers {
        match done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    open_streams = readers - finished,
                    "output pipes held open by a detached process, keeping partial output"
                );
                return Ok(());
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(())
}

fn take_capture(capture: &Mutex<Captured>) -> (Vec<u8>, usize) {
    let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
    let Captured { bytes, truncated } = std::mem::take(&mut *captured);
    (bytes, truncated)
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, capture: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_reader_counts_discarded_bytes() {
        let capture = Mutex::new(Captured::default());
        read_stream_limited(&b"hello world"[..], 5, &capture).expect("read");
        let (kept, truncated) = take_capture(&capture);
        assert_eq!(kept, b"hello");
        assert_eq!(truncated, 6);
    }

    #[test]
    fn drain_gives_up_on_readers_that_never_finish() {
        let (done_tx, done_rx) = mpsc::channel::<Result<()>>();
        done_tx.send(Ok(())).expect("send");

        let started = Instant::now();
        drain_readers(&done_rx, 2, Duration::from_millis(100)).expect("drain");
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(done_tx);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn detached_descendant_does_not_hold_the_run_open() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "setsid sleep 30 &\necho started\nsleep 30\n"]);
        contain(&mut cmd, ResourceLimits::default());
        let started = Instant::now();
        let output =
            run_command_with_timeout(cmd, None, Duration::from_millis(500), 1024, &CancelToken::new())
                .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.stdout, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output =
            run_command_with_timeout(cmd, None, Duration::from_secs(10), 1024, &CancelToken::new())
                .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_process_group() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 30 & sleep 30"]);
        contain(&mut cmd, ResourceLimits::default());
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_millis(300),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.stdout, b"started\n");
        assert!(output.elapsed < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_returns_cancelled_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        contain(&mut cmd, ResourceLimits::default());
        let err = run_command_with_timeout(cmd, None, Duration::from_secs(30), 1024, &cancel)
            .expect_err("cancelled");
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn stdin_is_forwarded() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat"]);
        let output = run_command_with_timeout(
            cmd,
            Some(b"prompt text"),
            Duration::from_secs(10),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(output.stdout, b"prompt text");
    }
}
