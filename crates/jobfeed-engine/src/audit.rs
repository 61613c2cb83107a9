//! Audit log sinks for extraction outcomes.
//!
//! Every extractor run produces exactly one audit record (the §6 contract
//! shape); the manager forwards it here regardless of success. A sink must
//! never fail the pipeline: write problems are logged and dropped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use jobfeed_core::ExtractionOutcome;
use tracing::{error, info};

pub trait AuditSink: Send + Sync {
    fn record(&self, outcome: &ExtractionOutcome);
}

/// Structured log line per run.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, outcome: &ExtractionOutcome) {
        info!(
            source = %outcome.source,
            success = outcome.success,
            scraped = outcome.scraped,
            new = outcome.new,
            updated = outcome.updated,
            errors = outcome.errors.len(),
            duration_seconds = outcome.duration_seconds,
            "extraction outcome"
        );
    }
}

/// Appends one JSON object per run to an audit file, which the external
/// reporting layer tails.
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, outcome: &ExtractionOutcome) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening audit log {}", self.path.display()))?;
        let line = serde_json::to_string(outcome).context("serializing audit record")?;
        writeln!(file, "{line}").with_context(|| format!("writing audit log {}", self.path.display()))?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, outcome: &ExtractionOutcome) {
        if let Err(e) = self.append(outcome) {
            error!(source = %outcome.source, error = %e, "failed to write audit record");
        }
    }
}

/// Collects outcomes in memory for test assertions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    outcomes: Mutex<Vec<ExtractionOutcome>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<ExtractionOutcome> {
        self.outcomes.lock().expect("audit lock").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, outcome: &ExtractionOutcome) {
        self.outcomes.lock().expect("audit lock").push(outcome.clone());
    }
}
