//! Append-only audit log: one JSON line per agent run, in per-day files.

pub mod events;

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::events::AuditEvent;

pub fn run_event(
    run_id: impl Into<String>,
    trigger_type: impl Into<String>,
    total_tokens: u64,
    success: bool,
    detail: impl Into<String>,
) -> AuditEvent {
    AuditEvent {
        kind: "run".to_string(),
        run_id: run_id.into(),
        trigger_type: trigger_type.into(),
        total_tokens,
        success,
        detail: detail.into(),
        timestamp: Utc::now(),
    }
}

/// Writes audit events under `<dir>/YYYY-MM-DD.jsonl`.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    dir: PathBuf,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record(&self, event: &AuditEvent) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create audit dir {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let line = serde_json::to_string(event).context("serialize audit event")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit file {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
