//! Supervised code-generation loop CLI.
//!
//! Turns natural-language commands into Python programs, admits them against
//! `.codeloop/config.toml` policy, runs them contained, judges the output,
//! and retries with a narrow diagnostic until success or the retry ceiling.

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use codeloop::cancel::{CancelToken, Cancelled};
use codeloop::core::admission::{AdmissionGate, AdmissionVerdict};
use codeloop::core::failure::AttemptFailure;
use codeloop::core::judge::{Judgment, OutputJudge};
use codeloop::exit_codes;
use codeloop::io::attempt_log::AttemptLog;
use codeloop::io::capability::{CapabilitySink, CapabilityWriter, NullCapabilitySink};
use codeloop::io::config::{CodeloopConfig, DEFAULT_CONFIG_PATH, init_config, load_config};
use codeloop::io::generator::CommandGenerator;
use codeloop::io::sandbox::{ProcessSandbox, Sandbox};
use codeloop::logging;
use codeloop::report::{SessionOutcome, SessionReport};
use codeloop::supervisor::Supervisor;
use codeloop::upstream::ThreadSleeper;

#[derive(Parser)]
#[command(
    name = "codeloop",
    version,
    about = "Generate, admit, execute, and judge code for natural-language commands"
)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the admission gate on a Python file without executing it.
    Check { file: PathBuf },
    /// Admit, execute, and judge a Python file (no generation).
    Exec { file: PathBuf },
    /// Service one command through the full supervised loop.
    Run {
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Read commands from stdin, one per line, servicing each in turn.
    Listen,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Check { file } => cmd_check(&cli.config, &file),
        Command::Exec { file } => cmd_exec(&cli.config, &file),
        Command::Run { command } => cmd_run(&cli.config, &command.join(" ")),
        Command::Listen => cmd_listen(&cli.config),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if init_config(config_path, force)? {
        println!("wrote {}", config_path.display());
    } else {
        println!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_check(config_path: &Path, file: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let source = read_source(file)?;
    let gate = AdmissionGate::new(cfg.admission)?;
    match gate.admit(&source) {
        AdmissionVerdict::Admitted => {
            println!("admitted");
            Ok(exit_codes::OK)
        }
        AdmissionVerdict::Rejected(rejection) => {
            println!("rejected: {rejection}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_exec(config_path: &Path, file: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let source = read_source(file)?;
    let gate = AdmissionGate::new(cfg.admission.clone())?;
    if let AdmissionVerdict::Rejected(rejection) = gate.admit(&source) {
        println!("rejected: {rejection}");
        return Ok(exit_codes::FAILED);
    }

    let cancel = install_cancel_handler()?;
    let sandbox = ProcessSandbox::from_config(&cfg.execution)?;
    let judge = OutputJudge::new(&cfg.judge.rules)?;
    let record = match sandbox.run(&source, cfg.execution.timeout(), &cancel) {
        Ok(record) => record,
        Err(err) if err.downcast_ref::<Cancelled>().is_some() => {
            println!("cancelled");
            return Ok(exit_codes::CANCELLED);
        }
        Err(err) => return Err(err),
    };

    print!("{}", record.stdout);
    eprint!("{}", record.stderr);
    match judge.judge(&record) {
        Judgment::Passed => Ok(exit_codes::OK),
        Judgment::Failed(failure) => {
            let diagnostic = AttemptFailure::Judged(failure).diagnostic(cfg.diagnostic_max_chars);
            println!("failed ({}): {}", diagnostic.kind, diagnostic.text);
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_run(config_path: &Path, command: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let cancel = install_cancel_handler()?;
    with_supervisor(&cfg, |supervisor| {
        let report = supervisor.run(command, &cancel)?;
        println!("{}", report.render());
        Ok(report_exit_code(&report))
    })
}

fn cmd_listen(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let cancel = install_cancel_handler()?;
    with_supervisor(&cfg, |supervisor| {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("read command from stdin")?;
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            let report = supervisor.run(command, &cancel)?;
            println!("{}", report.render());
            if cancel.is_cancelled() {
                return Ok(exit_codes::CANCELLED);
            }
        }
        Ok(exit_codes::OK)
    })
}

fn with_supervisor<F>(cfg: &CodeloopConfig, body: F) -> Result<i32>
where
    F: FnOnce(
        &mut Supervisor<CommandGenerator, ProcessSandbox, &dyn CapabilitySink, ThreadSleeper>,
    ) -> Result<i32>,
{
    let writer = if cfg.capabilities.enabled {
        Some(CapabilityWriter::spawn(cfg.capabilities.path.clone())?)
    } else {
        None
    };
    let sink: &dyn CapabilitySink = match &writer {
        Some(writer) => writer,
        None => &NullCapabilitySink,
    };

    let generator = CommandGenerator::from_config(&cfg.generator, &cfg.upstream);
    let sandbox = ProcessSandbox::from_config(&cfg.execution)?;
    let mut supervisor = Supervisor::new(cfg, generator, sandbox, sink, ThreadSleeper)?;
    if cfg.attempt_log.enabled {
        supervisor = supervisor.with_attempt_log(AttemptLog::new(&cfg.attempt_log.dir));
    }
    body(&mut supervisor)
}

fn report_exit_code(report: &SessionReport) -> i32 {
    match report.outcome {
        SessionOutcome::Succeeded { .. } => exit_codes::OK,
        SessionOutcome::Exhausted { .. } => exit_codes::EXHAUSTED,
        SessionOutcome::UpstreamUnavailable { .. } => exit_codes::UPSTREAM_UNAVAILABLE,
        SessionOutcome::Cancelled => exit_codes::CANCELLED,
    }
}

fn read_source(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("read {}", file.display()))
}

/// Ctrl-C sets the token; the running child's process group is then killed.
fn install_cancel_handler() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || {
        if handle.is_cancelled() {
            warn!("second interrupt, exiting");
            std::process::exit(exit_codes::CANCELLED);
        }
        eprintln!("\nCancelling...");
        handle.cancel();
    })
    .context("install interrupt handler")?;
    Ok(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["codeloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_run_joins_words() {
        let cli = Cli::parse_from(["codeloop", "--config", "c.toml", "run", "open", "notepad"]);
        match cli.command {
            Command::Run { command } => assert_eq!(command.join(" "), "open notepad"),
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("c.toml"));
    }

    #[test]
    fn parse_run_requires_command() {
        assert!(Cli::try_parse_from(["codeloop", "run"]).is_err());
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["codeloop", "check", "a.py", "--config", "x.toml"]);
        assert!(matches!(cli.command, Command::Check { .. }));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }
}
