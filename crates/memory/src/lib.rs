//! Episodic memory and session persistence.
//!
//! Episodes are an append-only JSONL transcript of what the agent did
//! (`episodes.jsonl` under the role's data directory); sessions are the
//! final message history of an autonomous run, one JSON file per session id,
//! kept so a later run can resume the conversation.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub category: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EpisodeStore {
    dir: PathBuf,
}

impl EpisodeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn episodes_path(&self) -> PathBuf {
        self.dir.join("episodes.jsonl")
    }

    pub fn capture(
        &self,
        category: impl Into<String>,
        summary: impl Into<String>,
        trigger_type: Option<String>,
    ) -> Result<()> {
        let episode = Episode {
            category: category.into(),
            summary: summary.into(),
            trigger_type,
            created_at: Utc::now(),
        };
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create memory dir {}", self.dir.display()))?;
        let line = serde_json::to_string(&episode).context("serialize episode")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.episodes_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Most recent `n` episodes, oldest first. Malformed lines are skipped.
    pub fn recent(&self, n: usize) -> Result<Vec<Episode>> {
        let path = self.episodes_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut episodes: Vec<Episode> = reader
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str(trimmed).ok()
            })
            .collect();
        if episodes.len() > n {
            let skip = episodes.len() - n;
            episodes.drain(..skip);
        }
        Ok(episodes)
    }

    /// Drop episodes older than `days`. Returns the number removed. The file
    /// is rewritten in place; a missing file is a no-op.
    pub fn prune_older_than(&self, days: u32) -> Result<usize> {
        let path = self.episodes_path();
        if !path.exists() || days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let all = self.recent(usize::MAX)?;
        let kept: Vec<&Episode> = all.iter().filter(|e| e.created_at >= cutoff).collect();
        let removed = all.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut out = String::new();
        for episode in &kept {
            out.push_str(&serde_json::to_string(episode)?);
            out.push('\n');
        }
        fs::write(&path, out)?;
        debug!(removed, "pruned old episodes");
        Ok(removed)
    }
}

fn sessions_dir(data_dir: &Path, role_name: &str) -> PathBuf {
    data_dir.join("sessions").join(role_name)
}

/// Persist the final message history of a run for `--resume`-style pickup.
/// Returns false (after logging) rather than erroring: losing a session file
/// must not fail the run that produced it.
pub fn save_session<M: Serialize>(
    data_dir: &Path,
    role_name: &str,
    session_id: &str,
    messages: &[M],
) -> bool {
    let dir = sessions_dir(data_dir, role_name);
    let write = || -> Result<()> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session_id}.json"));
        let rendered = serde_json::to_string_pretty(messages)?;
        fs::write(path, rendered)?;
        Ok(())
    };
    match write() {
        Ok(()) => true,
        Err(err) => {
            warn!(?err, session_id, "failed to save session");
            false
        }
    }
}

pub fn load_session<M: for<'de> Deserialize<'de>>(
    data_dir: &Path,
    role_name: &str,
    session_id: &str,
) -> Result<Vec<M>> {
    let path = sessions_dir(data_dir, role_name).join(format!("{session_id}.json"));
    let raw =
        fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))?;
    serde_json::from_str(&raw).context("parse session file")
}
