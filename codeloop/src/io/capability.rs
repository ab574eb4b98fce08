//! Capability persistence: successful sources saved for later reuse.
//!
//! Saving is fire-and-forget. [`CapabilityWriter`] hands requests to a
//! background thread, so the supervisor never blocks on the store and a
//! failed write never changes a session's result.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// A successful source offered to the capability store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub signature: String,
    pub command: String,
    pub source: String,
}

impl SaveRequest {
    pub fn new(command: &str, source: &str) -> Self {
        Self {
            signature: command_signature(command),
            command: command.to_string(),
            source: source.to_string(),
        }
    }
}

/// One line of the capability JSONL file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub signature: String,
    pub command: String,
    pub source: String,
    pub saved_at: String,
}

/// SHA-256 of the command with case and whitespace normalized.
pub fn command_signature(command: &str) -> String {
    let normalized = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub trait CapabilitySink {
    fn save(&self, request: SaveRequest);
}

impl<T: CapabilitySink + ?Sized> CapabilitySink for &T {
    fn save(&self, request: SaveRequest) {
        (**self).save(request);
    }
}

/// Sink that drops every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCapabilitySink;

impl CapabilitySink for NullCapabilitySink {
    fn save(&self, request: SaveRequest) {
        debug!(signature = %request.signature, "capability saving disabled");
    }
}

/// Appends capabilities to a JSONL file from a background thread.
///
/// Dropping the writer flushes pending requests and joins the thread.
pub struct CapabilityWriter {
    sender: Option<mpsc::Sender<SaveRequest>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CapabilityWriter {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<SaveRequest>();
        let handle = thread::Builder::new()
            .name("capability-writer".to_string())
            .spawn(move || {
                for request in receiver {
                    match append_record(&path, &request) {
                        Ok(()) => debug!(signature = %request.signature, "capability saved"),
                        Err(err) => warn!(err = %format!("{err:#}"), "failed to save capability"),
                    }
                }
            })
            .context("spawn capability writer")?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

impl CapabilitySink for CapabilityWriter {
    fn save(&self, request: SaveRequest) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(request).is_err() {
            warn!("capability writer stopped, request dropped");
        }
    }
}

impl Drop for CapabilityWriter {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("capability writer thread panicked");
        }
    }
}

fn append_record(path: &Path, request: &SaveRequest) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let record = CapabilityRecord {
        signature: request.signature.clone(),
        command: request.command.clone(),
        source: request.source.clone(),
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut line = serde_json::to_string(&record).context("serialize capability")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_case_and_spacing() {
        assert_eq!(
            command_signature("Open   Notepad\n"),
            command_signature("open notepad")
        );
        assert_ne!(command_signature("open notepad"), command_signature("open paint"));
        assert_eq!(command_signature("x").len(), 64);
    }

    #[test]
    fn writer_appends_jsonl_and_flushes_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store").join("capabilities.jsonl");
        {
            let writer = CapabilityWriter::spawn(path.clone()).expect("spawn");
            writer.save(SaveRequest::new("open notepad", "print(1)\n"));
            writer.save(SaveRequest::new("open paint", "print(2)\n"));
        }
        let contents = fs::read_to_string(&path).expect("read");
        let records: Vec<CapabilityRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("record"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].command, "open notepad");
        assert_eq!(records[0].signature, command_signature("open notepad"));
        assert_eq!(records[1].source, "print(2)\n");
    }

    #[test]
    fn write_failures_do_not_panic() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes every append fail.
        let path = temp.path().join("taken");
        fs::create_dir_all(&path).expect("mkdir");
        let writer = CapabilityWriter::spawn(path).expect("spawn");
        writer.save(SaveRequest::new("open notepad", "print(1)\n"));
        drop(writer);
    }
}
