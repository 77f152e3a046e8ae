//! Plan/finish reflection: the mutable per-run state the agent steers
//! through the `finish_task` and `update_plan` tools, and the renderer that
//! surfaces it back on every continuation prompt.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use vigil_llm::{ParamKind, ToolParam, ToolSpec, Toolset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PlanStepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Unknown statuses coerce to `pending`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    fn icon(self) -> char {
        match self {
            Self::Completed => 'x',
            Self::Failed => '!',
            Self::Skipped => '-',
            _ => ' ',
        }
    }
}

/// Outcome the agent declares through `finish_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "blocked" => Self::Blocked,
            "failed" => Self::Failed,
            _ => Self::Completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub description: String,
    pub status: PlanStepStatus,
    pub notes: String,
}

/// Per-run reflection state; never shared across autonomous invocations.
#[derive(Debug)]
pub struct ReflectionState {
    pub completed: bool,
    pub summary: String,
    pub status: RunStatus,
    pub steps: Vec<PlanStep>,
}

impl Default for ReflectionState {
    fn default() -> Self {
        Self {
            completed: false,
            summary: String::new(),
            status: RunStatus::Completed,
            steps: Vec::new(),
        }
    }
}

/// Render the plan for injection into a continuation prompt, so the agent
/// sees its progress even after history trimming.
pub fn format_reflection_state(state: &ReflectionState) -> String {
    if state.steps.is_empty() {
        return "(No plan created yet)".to_string();
    }
    let mut lines = vec!["Current Plan:".to_string()];
    for (i, step) in state.steps.iter().enumerate() {
        lines.push(format!(
            "  {}. [{}] {} ({})",
            i + 1,
            step.status.icon(),
            step.description,
            step.status.as_str()
        ));
        if !step.notes.is_empty() {
            lines.push(format!("       {}", step.notes));
        }
    }
    lines.join("\n")
}

/// The two reflection tools, bound to one run's state.
pub struct ReflectionToolset {
    state: Arc<Mutex<ReflectionState>>,
    max_plan_steps: usize,
}

impl ReflectionToolset {
    pub fn new(state: Arc<Mutex<ReflectionState>>, max_plan_steps: usize) -> Self {
        Self {
            state,
            max_plan_steps,
        }
    }

    fn finish_task(&self, args: &Value) -> String {
        let summary = args["summary"].as_str().unwrap_or_default();
        let status = RunStatus::parse(args["status"].as_str().unwrap_or("completed"));
        let mut state = self.state.lock();
        state.completed = true;
        state.summary = summary.to_string();
        state.status = status;
        format!("Task finished ({}).", status.as_str())
    }

    fn update_plan(&self, args: &Value) -> String {
        let raw_steps = args["steps"].as_array().cloned().unwrap_or_default();
        let mut steps = Vec::new();
        for raw in raw_steps.iter().take(self.max_plan_steps) {
            let description = raw["description"].as_str().unwrap_or_default();
            if description.is_empty() {
                continue;
            }
            steps.push(PlanStep {
                description: description.to_string(),
                status: PlanStepStatus::parse(raw["status"].as_str().unwrap_or("pending")),
                notes: raw["notes"].as_str().unwrap_or_default().to_string(),
            });
        }

        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for step in &steps {
            *counts.entry(step.status.as_str()).or_default() += 1;
        }
        self.state.lock().steps = steps;

        if counts.is_empty() {
            "Plan cleared.".to_string()
        } else {
            let parts: Vec<String> = counts
                .iter()
                .map(|(status, count)| format!("{count} {status}"))
                .collect();
            format!("Plan updated: {}", parts.join(", "))
        }
    }
}

#[async_trait::async_trait]
impl Toolset for ReflectionToolset {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "finish_task".to_string(),
                description: "Signal that the current task is done. Call this when you have \
                              completed the task, are blocked and cannot proceed, or have failed."
                    .to_string(),
                params: vec![
                    ToolParam::required(
                        "summary",
                        "A brief summary of what was accomplished or why blocked/failed.",
                    ),
                    ToolParam::optional("status", "The outcome: completed, blocked, or failed."),
                ],
            },
            ToolSpec {
                name: "update_plan".to_string(),
                description: "Replace the current plan with a new list of steps. Each step has a \
                              'description' and optionally 'status' \
                              (pending/in_progress/completed/failed/skipped) and 'notes'."
                    .to_string(),
                params: vec![ToolParam::required(
                    "steps",
                    "Plan steps with keys: description, status (optional), notes (optional).",
                )
                .kind(ParamKind::ObjectArray)],
            },
        ]
    }

    async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<String> {
        match name {
            "finish_task" => Ok(self.finish_task(&args)),
            "update_plan" => Ok(self.update_plan(&args)),
            other => anyhow::bail!("unknown reflection tool: {other}"),
        }
    }
}
