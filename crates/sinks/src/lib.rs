//! Run-result sinks: where agent output lands besides the originating
//! channel. Delivery is best-effort per sink; a failing sink is logged and
//! the rest still receive the record.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRecord {
    pub run_id: String,
    pub prompt: String,
    pub output: String,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_metadata: HashMap<String, String>,
    pub total_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, record: &SinkRecord) -> Result<()>;
}

pub struct ConsoleSink;

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn deliver(&self, record: &SinkRecord) -> Result<()> {
        println!("[{}] {}", record.trigger_type, record.output);
        Ok(())
    }
}

/// Appends one JSON line per record.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn deliver(&self, record: &SinkRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record).context("serialize sink record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open sink file {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct SinkDispatcher {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkDispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn dispatch(
        &self,
        run_id: &str,
        prompt: &str,
        output: &str,
        total_tokens: u64,
        trigger_type: &str,
        trigger_metadata: &HashMap<String, String>,
    ) {
        let record = SinkRecord {
            run_id: run_id.to_string(),
            prompt: prompt.to_string(),
            output: output.to_string(),
            trigger_type: trigger_type.to_string(),
            trigger_metadata: trigger_metadata.clone(),
            total_tokens,
            timestamp: Utc::now(),
        };
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(&record) {
                warn!(sink = sink.name(), ?err, "sink delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        fn deliver(&self, _record: &SinkRecord) -> Result<()> {
            anyhow::bail!("down")
        }
    }

    #[test]
    fn file_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.jsonl");
        let dispatcher = SinkDispatcher::new(vec![Box::new(FileSink::new(&path))]);

        dispatcher.dispatch("r1", "p", "first", 5, "cron", &HashMap::new());
        dispatcher.dispatch("r2", "p", "second", 6, "cron", &HashMap::new());

        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<SinkRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output, "second");
        assert_eq!(records[0].total_tokens, 5);
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let dispatcher = SinkDispatcher::new(vec![
            Box::new(FailingSink),
            Box::new(FileSink::new(&path)),
        ]);
        dispatcher.dispatch("r1", "p", "out", 1, "webhook", &HashMap::new());
        assert!(path.exists());
    }
}
