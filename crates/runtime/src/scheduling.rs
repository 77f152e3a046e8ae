//! Self-scheduling tools: `schedule_followup` and `schedule_followup_at`.
//!
//! Bound to the daemon's shared schedule queue with a per-binding quota, so
//! each autonomous run gets a fresh toolset and a fresh
//! `max_scheduled_per_run` allowance. Every refusal is returned as a string
//! the model can read and react to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use vigil_config::AutonomyConfig;
use vigil_llm::{ParamKind, ToolParam, ToolSpec, Toolset};
use vigil_triggers::ScheduleQueue;

pub struct SchedulingToolset {
    queue: Arc<ScheduleQueue>,
    max_per_run: usize,
    max_delay_seconds: u64,
    scheduled_this_run: AtomicUsize,
}

impl SchedulingToolset {
    pub fn new(config: &AutonomyConfig, queue: Arc<ScheduleQueue>) -> Self {
        Self {
            queue,
            max_per_run: config.max_scheduled_per_run,
            max_delay_seconds: config.max_schedule_delay_seconds,
            scheduled_this_run: AtomicUsize::new(0),
        }
    }

    fn quota_exhausted(&self) -> bool {
        self.scheduled_this_run.load(Ordering::SeqCst) >= self.max_per_run
    }

    fn schedule(&self, prompt: &str, delay_seconds: f64) -> String {
        match self.queue.schedule(prompt, delay_seconds, "daemon") {
            Ok(task_id) => {
                self.scheduled_this_run.fetch_add(1, Ordering::SeqCst);
                format!("Scheduled follow-up in {delay_seconds:.0}s (task_id={task_id}).")
            }
            Err(err) => err.to_string(),
        }
    }

    fn schedule_followup(&self, args: &Value) -> String {
        if self.quota_exhausted() {
            return format!("Cannot schedule: per-run limit ({}) reached.", self.max_per_run);
        }
        let prompt = args["prompt"].as_str().unwrap_or_default();
        let delay_seconds = args["delay_seconds"].as_i64().unwrap_or(0);
        if delay_seconds < 1 {
            return "Cannot schedule: delay must be at least 1 second.".to_string();
        }
        if delay_seconds as u64 > self.max_delay_seconds {
            return format!(
                "Cannot schedule: delay exceeds maximum ({}s).",
                self.max_delay_seconds
            );
        }
        self.schedule(prompt, delay_seconds as f64)
    }

    fn schedule_followup_at(&self, args: &Value) -> String {
        if self.quota_exhausted() {
            return format!("Cannot schedule: per-run limit ({}) reached.", self.max_per_run);
        }
        let prompt = args["prompt"].as_str().unwrap_or_default();
        let raw = args["iso_datetime"].as_str().unwrap_or_default();
        let Some(target) = parse_iso_utc(raw) else {
            return format!("Invalid ISO datetime: {raw}");
        };
        let delay = (target - Utc::now()).num_milliseconds() as f64 / 1000.0;
        if delay < 1.0 {
            return "Cannot schedule: target time is in the past.".to_string();
        }
        if delay > self.max_delay_seconds as f64 {
            return format!(
                "Cannot schedule: delay exceeds maximum ({}s).",
                self.max_delay_seconds
            );
        }
        match self.queue.schedule(prompt, delay, "daemon") {
            Ok(task_id) => {
                self.scheduled_this_run.fetch_add(1, Ordering::SeqCst);
                format!("Scheduled follow-up at {raw} (task_id={task_id}).")
            }
            Err(err) => err.to_string(),
        }
    }
}

/// Accepts RFC 3339 (offset applied) or a naive ISO timestamp assumed UTC.
fn parse_iso_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait::async_trait]
impl Toolset for SchedulingToolset {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "schedule_followup".to_string(),
                description: "Schedule a follow-up agent run after a delay.".to_string(),
                params: vec![
                    ToolParam::required("prompt", "The prompt for the follow-up run."),
                    ToolParam::required(
                        "delay_seconds",
                        "Seconds to wait before running (max 86400 = 24h).",
                    )
                    .kind(ParamKind::Integer),
                ],
            },
            ToolSpec {
                name: "schedule_followup_at".to_string(),
                description: "Schedule a follow-up agent run at a specific time.".to_string(),
                params: vec![
                    ToolParam::required("prompt", "The prompt for the follow-up run."),
                    ToolParam::required(
                        "iso_datetime",
                        "ISO 8601 datetime string (e.g. '2024-01-15T14:30:00Z').",
                    ),
                ],
            },
        ]
    }

    async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<String> {
        match name {
            "schedule_followup" => Ok(self.schedule_followup(&args)),
            "schedule_followup_at" => Ok(self.schedule_followup_at(&args)),
            other => anyhow::bail!("unknown scheduling tool: {other}"),
        }
    }
}
