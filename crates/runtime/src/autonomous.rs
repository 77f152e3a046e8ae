//! The autonomous loop: drive the agent iteration by iteration until it
//! declares completion through `finish_task` or a guardrail fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use vigil_config::RoleDefinition;
use vigil_llm::{AgentExecutor, ChatMessage, ExecuteRequest, RunResult, Toolset};
use vigil_memory::{save_session, EpisodeStore};
use vigil_sinks::SinkDispatcher;
use vigil_triggers::is_conversational;

use crate::display;
use crate::history::trim_message_history;
use crate::reflection::{format_reflection_state, ReflectionState, ReflectionToolset, RunStatus};

/// Terminal state of an autonomous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Completed,
    Blocked,
    Failed,
    Timeout,
    BudgetExceeded,
    MaxIterations,
    Error,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::BudgetExceeded => "budget_exceeded",
            Self::MaxIterations => "max_iterations",
            Self::Error => "error",
        }
    }
}

impl From<RunStatus> for FinalStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => Self::Completed,
            RunStatus::Blocked => Self::Blocked,
            RunStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug)]
pub struct AutonomousResult {
    pub run_id: String,
    pub iterations: Vec<RunResult>,
    pub final_output: String,
    pub final_status: FinalStatus,
    pub finish_summary: Option<String>,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_tokens: u64,
    pub total_tool_calls: u32,
    pub total_duration_ms: u64,
    pub iteration_count: usize,
    pub success: bool,
    pub error: Option<String>,
    pub final_messages: Vec<ChatMessage>,
}

#[derive(Default)]
pub struct AutonomousOptions {
    pub trigger_type: Option<String>,
    pub trigger_metadata: HashMap<String, String>,
    pub message_history: Option<Vec<ChatMessage>>,
    pub extra_toolsets: Vec<Arc<dyn Toolset>>,
    pub max_iterations_override: Option<u32>,
}

fn build_result(
    run_id: String,
    iterations: Vec<RunResult>,
    cumulative_tokens: u64,
    final_status: FinalStatus,
    error: Option<String>,
    finish_summary: Option<String>,
    duration_ms: u64,
    final_messages: Vec<ChatMessage>,
) -> AutonomousResult {
    let final_output = iterations.last().map(|r| r.output.clone()).unwrap_or_default();
    AutonomousResult {
        total_tokens_in: iterations.iter().map(|r| r.tokens_in).sum(),
        total_tokens_out: iterations.iter().map(|r| r.tokens_out).sum(),
        total_tool_calls: iterations.iter().map(|r| r.tool_calls).sum(),
        iteration_count: iterations.len(),
        success: matches!(final_status, FinalStatus::Completed | FinalStatus::MaxIterations),
        run_id,
        final_output,
        iterations,
        final_status,
        finish_summary,
        total_tokens: cumulative_tokens,
        total_duration_ms: duration_ms,
        error,
        final_messages,
    }
}

/// Execute the loop until `finish_task`, an error, or a guardrail.
#[allow(clippy::too_many_lines)]
pub async fn run_autonomous(
    executor: Arc<dyn AgentExecutor>,
    role: &RoleDefinition,
    prompt: &str,
    options: AutonomousOptions,
    sinks: Option<&SinkDispatcher>,
    episodes: Option<&EpisodeStore>,
) -> AutonomousResult {
    let run_id = new_short_id();
    let session_id = new_short_id();
    let autonomy = role.spec.autonomy.clone().unwrap_or_default();
    let guardrails = &role.spec.guardrails;
    let max_iterations = options
        .max_iterations_override
        .unwrap_or(guardrails.max_iterations)
        .max(1);
    let token_budget = guardrails.autonomous_token_budget;
    let timeout = guardrails.autonomous_timeout_seconds.map(Duration::from_secs);
    let trigger_type = options.trigger_type.as_deref().unwrap_or("autonomous");
    let conversational = is_conversational(trigger_type);

    let reflection_state = Arc::new(Mutex::new(ReflectionState::default()));
    let reflection_toolset: Arc<dyn Toolset> = Arc::new(ReflectionToolset::new(
        Arc::clone(&reflection_state),
        autonomy.max_plan_steps,
    ));
    let mut toolsets = vec![reflection_toolset];
    toolsets.extend(options.extra_toolsets.iter().cloned());

    let mut message_history = options.message_history;
    let mut iterations: Vec<RunResult> = Vec::new();
    let mut cumulative_tokens: u64 = 0;
    let mut consecutive_no_tool_calls: u32 = 0;
    let mut final_status = FinalStatus::MaxIterations;
    let mut error_msg: Option<String> = None;
    let loop_start = tokio::time::Instant::now();

    info!(%run_id, trigger_type, max_iterations, "autonomous run starting");

    for iteration in 1..=max_iterations {
        if let Some(limit) = timeout {
            if loop_start.elapsed() >= limit {
                final_status = FinalStatus::Timeout;
                warn!(%run_id, "autonomous wall-clock timeout reached");
                break;
            }
        }
        if let Some(budget) = token_budget {
            if cumulative_tokens >= budget {
                final_status = FinalStatus::BudgetExceeded;
                warn!(%run_id, cumulative_tokens, budget, "autonomous token budget exhausted");
                break;
            }
        }

        let iter_prompt = if iteration == 1 {
            prompt.to_string()
        } else {
            let state_text = format_reflection_state(&reflection_state.lock());
            let mut text = format!(
                "{}\n\nCURRENT STATUS:\n{}",
                autonomy.continuation_prompt, state_text
            );
            // A chat user never sees continuation prompts; steer a stalled
            // agent toward finish_task instead of repeating its question.
            if consecutive_no_tool_calls > 0 && conversational {
                text.push_str(
                    "\n\nIMPORTANT: You did not use any tools in your last response. If you \
                     cannot proceed without additional user input, call \
                     finish_task(summary='...', status='blocked') immediately. Do NOT repeat \
                     your question — the user will send a new message.",
                );
            }
            text
        };

        let mut metadata = options.trigger_metadata.clone();
        metadata.insert("autonomous_run_id".to_string(), run_id.clone());
        metadata.insert("iteration".to_string(), iteration.to_string());

        let request = ExecuteRequest {
            system_prompt: role.spec.role.clone(),
            prompt: iter_prompt,
            message_history: message_history.take(),
            trigger_type: trigger_type.to_string(),
            trigger_metadata: metadata,
            toolsets: toolsets.clone(),
        };

        let (result, new_messages) = match executor.execute(request).await {
            Ok(pair) => pair,
            Err(err) => {
                final_status = FinalStatus::Error;
                error_msg = Some(err.to_string());
                warn!(%run_id, iteration, %err, "executor failed");
                break;
            }
        };

        cumulative_tokens += result.total_tokens;
        iterations.push(result);
        message_history = Some(trim_message_history(
            new_messages,
            autonomy.max_history_messages,
            true,
        ));

        // Precedence: an explicit finish_task wins over everything else
        // observed in the same iteration.
        let (completed, status) = {
            let state = reflection_state.lock();
            (state.completed, state.status)
        };
        if completed {
            final_status = status.into();
            break;
        }

        let last = match iterations.last() {
            Some(last) => last,
            None => break,
        };
        if !last.success {
            final_status = FinalStatus::Error;
            error_msg = last.error.clone();
            break;
        }

        // One model response per chat turn; the user asked one question.
        if conversational {
            final_status = FinalStatus::Completed;
            break;
        }

        if last.tool_calls == 0 {
            consecutive_no_tool_calls += 1;
            if consecutive_no_tool_calls >= autonomy.max_no_tool_call_iterations {
                let summary = format!(
                    "Stopped: no tool calls for {consecutive_no_tool_calls} consecutive iterations."
                );
                let mut state = reflection_state.lock();
                state.completed = true;
                state.status = RunStatus::Blocked;
                state.summary = summary;
                final_status = FinalStatus::Blocked;
                break;
            }
        } else {
            consecutive_no_tool_calls = 0;
        }

        if autonomy.iteration_delay_seconds > 0.0 && iteration < max_iterations {
            tokio::time::sleep(Duration::from_secs_f64(autonomy.iteration_delay_seconds)).await;
        }
    }

    let duration_ms = loop_start.elapsed().as_millis() as u64;
    let finish_summary = {
        let state = reflection_state.lock();
        if state.summary.is_empty() {
            None
        } else {
            Some(state.summary.clone())
        }
    };

    let result = build_result(
        run_id,
        iterations,
        cumulative_tokens,
        final_status,
        error_msg,
        finish_summary,
        duration_ms,
        message_history.unwrap_or_default(),
    );

    finish_run(&result, role, prompt, &session_id, sinks, episodes);
    result
}

/// Post-loop side effects: session save, episode capture, retention pass,
/// sink dispatch, summary display.
fn finish_run(
    result: &AutonomousResult,
    role: &RoleDefinition,
    prompt: &str,
    session_id: &str,
    sinks: Option<&SinkDispatcher>,
    episodes: Option<&EpisodeStore>,
) {
    if let Some(memory) = &role.spec.memory {
        if memory.enabled && !result.final_messages.is_empty() {
            save_session(
                std::path::Path::new(&memory.data_dir),
                &role.metadata.name,
                session_id,
                &result.final_messages,
            );
        }
        if let (Some(store), Some(summary)) = (episodes, result.finish_summary.as_deref()) {
            if let Err(err) = store.capture("autonomous_run", summary, None) {
                warn!(?err, "failed to capture autonomous episode");
            }
        }
        if let Some(store) = episodes {
            if let Err(err) = store.prune_older_than(memory.retain_episodes_days) {
                warn!(?err, "episode retention pass failed");
            }
        }
    }

    if let (Some(dispatcher), Some(last)) = (sinks, result.iterations.last()) {
        dispatcher.dispatch(
            &result.run_id,
            prompt,
            &last.output,
            result.total_tokens,
            "autonomous",
            &HashMap::new(),
        );
    }

    display::autonomous_summary(result);
}

fn new_short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptStep, ScriptedExecutor};
    use serde_json::json;

    fn make_role(max_iterations: u32) -> RoleDefinition {
        serde_yaml::from_str::<RoleDefinition>(&format!(
            r#"
apiVersion: v1
kind: Agent
metadata:
  name: test-agent
spec:
  role: You are a test agent.
  autonomy: {{}}
  guardrails:
    max_iterations: {max_iterations}
"#
        ))
        .unwrap()
    }

    async fn run(
        executor: ScriptedExecutor,
        role: &RoleDefinition,
        trigger_type: Option<&str>,
    ) -> (AutonomousResult, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let options = AutonomousOptions {
            trigger_type: trigger_type.map(str::to_string),
            ..Default::default()
        };
        let result = run_autonomous(
            Arc::clone(&executor) as Arc<dyn AgentExecutor>,
            role,
            "do something",
            options,
            None,
            None,
        )
        .await;
        (result, executor)
    }

    #[tokio::test]
    async fn finish_task_ends_run_with_declared_status() {
        let script = vec![
            ScriptStep::respond("working").with_tool_calls(2),
            ScriptStep::respond("done")
                .invoking("finish_task", json!({"summary": "wrote the report", "status": "completed"})),
        ];
        let role = make_role(10);
        let (result, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Completed);
        assert_eq!(result.iteration_count, 2);
        assert!(result.success);
        assert_eq!(result.finish_summary.as_deref(), Some("wrote the report"));
        assert_eq!(result.final_output, "done");
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn finish_task_blocked_status_propagates() {
        let script = vec![ScriptStep::respond("stuck")
            .invoking("finish_task", json!({"summary": "need credentials", "status": "blocked"}))];
        let role = make_role(10);
        let (result, _) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Blocked);
        assert!(!result.success);
        assert_eq!(result.iteration_count, 1);
    }

    #[tokio::test]
    async fn spin_guard_stops_after_default_two() {
        let script = vec![ScriptStep::respond("I need more info")];
        let role = make_role(10);
        let (result, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Blocked);
        assert_eq!(result.iteration_count, 2);
        assert_eq!(executor.call_count(), 2);
        assert!(result
            .finish_summary
            .as_deref()
            .unwrap()
            .contains("no tool calls for 2 consecutive iterations"));
    }

    #[tokio::test]
    async fn spin_guard_counter_resets_on_tool_use() {
        let script = vec![
            ScriptStep::respond("thinking..."),
            ScriptStep::respond("used tool").with_tool_calls(1),
            ScriptStep::respond("thinking again..."),
            ScriptStep::respond("still thinking..."),
        ];
        let role = make_role(10);
        let (result, _) = run(ScriptedExecutor::new(script), &role, None).await;
        // no-tool, tool, no-tool, no-tool(blocked)
        assert_eq!(result.iteration_count, 4);
        assert_eq!(result.final_status, FinalStatus::Blocked);
    }

    #[tokio::test]
    async fn spin_guard_threshold_configurable() {
        let mut role = make_role(10);
        if let Some(autonomy) = role.spec.autonomy.as_mut() {
            autonomy.max_no_tool_call_iterations = 3;
        }
        let script = vec![ScriptStep::respond("thinking...")];
        let (result, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Blocked);
        assert_eq!(result.iteration_count, 3);
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn telegram_exits_after_one_iteration_even_with_tools() {
        let script = vec![ScriptStep::respond("Here's your answer").with_tool_calls(2)];
        let role = make_role(10);
        let (result, executor) = run(ScriptedExecutor::new(script), &role, Some("telegram")).await;
        assert_eq!(result.final_status, FinalStatus::Completed);
        assert_eq!(result.iteration_count, 1);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(result.final_output, "Here's your answer");
    }

    #[tokio::test]
    async fn discord_exits_after_one_iteration() {
        let script = vec![ScriptStep::respond("Done")];
        let role = make_role(10);
        let (result, _) = run(ScriptedExecutor::new(script), &role, Some("discord")).await;
        assert_eq!(result.final_status, FinalStatus::Completed);
        assert_eq!(result.iteration_count, 1);
    }

    #[tokio::test]
    async fn non_conversational_trigger_loops_to_max() {
        let script = vec![ScriptStep::respond("working...").with_tool_calls(1)];
        let role = make_role(3);
        let (result, executor) = run(ScriptedExecutor::new(script), &role, Some("cron")).await;
        assert_eq!(result.final_status, FinalStatus::MaxIterations);
        assert!(result.success);
        assert_eq!(result.iteration_count, 3);
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn iteration_error_ends_run() {
        let script = vec![
            ScriptStep::respond("ok").with_tool_calls(1),
            ScriptStep::failing("rate limited"),
        ];
        let role = make_role(10);
        let (result, _) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Error);
        assert_eq!(result.error.as_deref(), Some("rate limited"));
        assert_eq!(result.iteration_count, 2);
        // Partial results survive.
        assert_eq!(result.iterations[0].output, "ok");
    }

    #[tokio::test]
    async fn token_budget_exits_before_next_iteration() {
        let mut role = make_role(10);
        role.spec.guardrails.autonomous_token_budget = Some(25);
        let script = vec![ScriptStep::respond("w").with_tool_calls(1).with_tokens(20)];
        let (result, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        // Iteration 1 consumes 20; guard fires entering iteration 3 (20+20 >= 25
        // after two iterations).
        assert_eq!(result.final_status, FinalStatus::BudgetExceeded);
        assert_eq!(executor.call_count(), 2);
        assert_eq!(result.total_tokens, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_timeout_exits() {
        let mut role = make_role(100);
        role.spec.guardrails.autonomous_timeout_seconds = Some(1);
        let script = vec![ScriptStep::respond("slow")
            .with_tool_calls(1)
            .with_latency(Duration::from_millis(600))];
        let (result, _) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.final_status, FinalStatus::Timeout);
        assert!(result.iteration_count >= 1);
        assert!(result.iteration_count <= 2);
    }

    #[tokio::test]
    async fn continuation_prompt_carries_plan_block() {
        let script = vec![
            ScriptStep::respond("planned").invoking(
                "update_plan",
                json!({"steps": [{"description": "collect input", "status": "completed"}]}),
            ),
            ScriptStep::respond("done")
                .invoking("finish_task", json!({"summary": "ok", "status": "completed"})),
        ];
        let role = make_role(10);
        let (_, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        let calls = executor.calls.lock();
        assert_eq!(calls[0].prompt, "do something");
        assert!(calls[1].prompt.contains("CURRENT STATUS:"));
        assert!(calls[1].prompt.contains("Current Plan:"));
        assert!(calls[1].prompt.contains("[x] collect input (completed)"));
    }

    #[tokio::test]
    async fn continuation_prompt_without_plan_says_so() {
        let script = vec![ScriptStep::respond("hmm").with_tool_calls(1)];
        let role = make_role(2);
        let (_, executor) = run(ScriptedExecutor::new(script), &role, None).await;
        let calls = executor.calls.lock();
        assert!(calls[1].prompt.contains("(No plan created yet)"));
    }

    #[tokio::test]
    async fn metadata_carries_run_id_and_iteration() {
        let script = vec![ScriptStep::respond("w").with_tool_calls(1)];
        let role = make_role(2);
        let (result, executor) = run(ScriptedExecutor::new(script), &role, Some("cron")).await;
        let calls = executor.calls.lock();
        assert_eq!(
            calls[0].metadata.get("autonomous_run_id").map(String::as_str),
            Some(result.run_id.as_str())
        );
        assert_eq!(calls[0].metadata.get("iteration").map(String::as_str), Some("1"));
        assert_eq!(calls[1].metadata.get("iteration").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn prior_history_reaches_first_iteration() {
        let script = vec![ScriptStep::respond("hi there")];
        let role = make_role(10);
        let executor = Arc::new(ScriptedExecutor::new(script));
        let options = AutonomousOptions {
            trigger_type: Some("telegram".to_string()),
            message_history: Some(vec![
                ChatMessage::system("sys"),
                ChatMessage::user("earlier"),
                ChatMessage::assistant("earlier reply"),
            ]),
            ..Default::default()
        };
        let result = run_autonomous(
            Arc::clone(&executor) as Arc<dyn AgentExecutor>,
            &role,
            "hello again",
            options,
            None,
            None,
        )
        .await;
        assert_eq!(executor.calls.lock()[0].history_len, 3);
        assert!(!result.final_messages.is_empty());
    }

    #[tokio::test]
    async fn final_output_is_last_iteration_output() {
        let script = vec![
            ScriptStep::respond("first").with_tool_calls(1),
            ScriptStep::respond("second").with_tool_calls(1),
        ];
        let role = make_role(2);
        let (result, _) = run(ScriptedExecutor::new(script), &role, Some("cron")).await;
        assert_eq!(result.final_output, "second");
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(
            result.final_output,
            result.iterations.last().unwrap().output
        );
    }

    #[tokio::test]
    async fn finish_persists_session_and_episode() {
        let dir = tempfile::tempdir().unwrap();
        let mut role = make_role(10);
        role.spec.memory = Some(vigil_config::MemoryConfig {
            enabled: true,
            data_dir: dir.path().to_string_lossy().into_owned(),
            retain_episodes_days: 30,
        });
        let episodes = vigil_memory::EpisodeStore::new(dir.path().join("memory"));
        let script = vec![ScriptStep::respond("done")
            .invoking("finish_task", json!({"summary": "report finished"}))];
        let executor = Arc::new(ScriptedExecutor::new(script));
        let result = run_autonomous(
            executor as Arc<dyn AgentExecutor>,
            &role,
            "task",
            AutonomousOptions::default(),
            None,
            Some(&episodes),
        )
        .await;
        assert!(result.success);

        let session_files: Vec<_> =
            std::fs::read_dir(dir.path().join("sessions").join("test-agent"))
                .unwrap()
                .collect();
        assert_eq!(session_files.len(), 1);

        let recent = episodes.recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].summary, "report finished");
        assert_eq!(recent[0].category, "autonomous_run");
    }

    #[tokio::test]
    async fn final_output_reaches_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("results.jsonl");
        let sinks = vigil_sinks::SinkDispatcher::new(vec![Box::new(
            vigil_sinks::FileSink::new(&sink_path),
        )]);
        let script = vec![ScriptStep::respond("the answer")
            .invoking("finish_task", json!({"summary": "s"}))];
        let executor = Arc::new(ScriptedExecutor::new(script));
        let role = make_role(10);
        run_autonomous(
            executor as Arc<dyn AgentExecutor>,
            &role,
            "task",
            AutonomousOptions::default(),
            Some(&sinks),
            None,
        )
        .await;
        let content = std::fs::read_to_string(&sink_path).unwrap();
        assert!(content.contains("the answer"));
    }

    #[tokio::test]
    async fn totals_accumulate_across_iterations() {
        let script = vec![
            ScriptStep::respond("a").with_tool_calls(2).with_tokens(30),
            ScriptStep::respond("b")
                .with_tokens(12)
                .invoking("finish_task", json!({"summary": "s"})),
        ];
        let role = make_role(10);
        let (result, _) = run(ScriptedExecutor::new(script), &role, None).await;
        assert_eq!(result.total_tokens, 42);
        assert_eq!(result.total_tool_calls, 3);
        assert_eq!(result.total_tokens_in + result.total_tokens_out, 42);
    }
}
