use serde::{Deserialize, Serialize};

/// Policy for the autonomous loop. Present on a role iff the agent may
/// iterate without a human in the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Prompt sent on every iteration after the first.
    pub continuation_prompt: String,
    pub max_history_messages: usize,
    pub max_plan_steps: usize,
    pub iteration_delay_seconds: f64,
    pub max_scheduled_per_run: usize,
    pub max_scheduled_total: usize,
    pub max_schedule_delay_seconds: u64,
    /// Consecutive tool-less iterations before the run is declared blocked.
    pub max_no_tool_call_iterations: u32,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            continuation_prompt: "Continue working on the task. Review your progress so far and \
                                  decide your next step. If you have completed the task, call the \
                                  finish_task tool with a summary."
                .to_string(),
            max_history_messages: 40,
            max_plan_steps: 20,
            iteration_delay_seconds: 0.0,
            max_scheduled_per_run: 3,
            max_scheduled_total: 50,
            max_schedule_delay_seconds: 86_400,
            max_no_tool_call_iterations: 2,
        }
    }
}
