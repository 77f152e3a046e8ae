//! Event ingress: trigger events, the five trigger drivers, their lifecycle,
//! and the in-memory schedule queue for agent-initiated follow-ups.
//!
//! Every driver runs as a spawned task holding a `watch` stop receiver it
//! must observe at least once a second, and emits [`TriggerEvent`]s into a
//! shared mpsc channel. The daemon owns the receiving end and applies its
//! own admission control; drivers never block on it beyond channel capacity.

mod cron;
mod dispatcher;
mod discord;
mod file_watch;
mod rate_limit;
mod schedule_queue;
mod telegram;
mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

pub use dispatcher::{spawn_triggers, TriggerSet};
pub use rate_limit::TokenBucketRateLimiter;
pub use schedule_queue::{ScheduleError, ScheduleQueue};

/// Trigger types whose events are conversational turns (a human is waiting
/// on the other end of a chat).
pub const CONVERSATIONAL_TRIGGER_TYPES: &[&str] = &["telegram", "discord"];

pub fn is_conversational(trigger_type: &str) -> bool {
    CONVERSATIONAL_TRIGGER_TYPES.contains(&trigger_type)
}

/// Out-of-band delivery back to the originating channel.
pub type ReplyFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Channel the drivers (and the schedule queue) emit into.
pub type EventSender = tokio::sync::mpsc::Sender<TriggerEvent>;

/// One external stimulus. Immutable once emitted; only `reply_fn` is
/// consumed by the dispatcher.
#[derive(Clone)]
pub struct TriggerEvent {
    pub trigger_type: String,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub reply_fn: Option<ReplyFn>,
}

impl TriggerEvent {
    pub fn new(trigger_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            trigger_type: trigger_type.into(),
            prompt: prompt.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            reply_fn: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_reply(mut self, reply_fn: ReplyFn) -> Self {
        self.reply_fn = Some(reply_fn);
        self
    }

    /// Stable key for conversational streams, `None` for stateless events.
    pub fn conversation_key(&self) -> Option<String> {
        match self.trigger_type.as_str() {
            "telegram" => self
                .metadata
                .get("chat_id")
                .filter(|id| !id.is_empty())
                .map(|id| format!("telegram:{id}")),
            "discord" => self
                .metadata
                .get("channel_id")
                .filter(|id| !id.is_empty())
                .map(|id| format!("discord:{id}")),
            _ => None,
        }
    }
}

impl fmt::Debug for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEvent")
            .field("trigger_type", &self.trigger_type)
            .field("prompt", &self.prompt)
            .field("timestamp", &self.timestamp)
            .field("metadata", &self.metadata)
            .field("reply_fn", &self.reply_fn.is_some())
            .finish()
    }
}

/// Split `text` into chunks of at most `limit` characters, preferring to
/// break at the last newline before the limit and hard-cutting otherwise.
/// Leading newlines are stripped from each chunk after the first.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        if rest.chars().count() <= limit {
            chunks.push(rest.to_string());
            break;
        }
        let hard_cut = rest
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let split_at = match rest[..hard_cut].rfind('\n') {
            Some(idx) if idx > 0 => idx,
            _ => hard_cut,
        };
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    chunks
}

/// Wait until the stop flag flips true (or its sender is gone, which also
/// means shutdown).
pub(crate) async fn stopped(stop: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
