//! Scripted executor test double shared by the autonomous-loop and daemon
//! tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use vigil_llm::{AgentExecutor, ChatMessage, ExecuteRequest, RunResult};

/// One scripted iteration: which tools to invoke against the supplied
/// toolsets, then what the "model" answers.
#[derive(Clone)]
pub(crate) struct ScriptStep {
    pub tool_invocations: Vec<(String, serde_json::Value)>,
    pub output: String,
    pub tool_calls: u32,
    pub tokens: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Simulated model latency; meaningful under paused tokio time.
    pub latency: Duration,
}

impl ScriptStep {
    pub fn respond(output: &str) -> Self {
        Self {
            tool_invocations: Vec::new(),
            output: output.to_string(),
            tool_calls: 0,
            tokens: 10,
            success: true,
            error: None,
            latency: Duration::ZERO,
        }
    }

    pub fn with_tool_calls(mut self, n: u32) -> Self {
        self.tool_calls = n;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn invoking(mut self, tool: &str, args: serde_json::Value) -> Self {
        self.tool_invocations.push((tool.to_string(), args));
        if self.tool_calls == 0 {
            self.tool_calls = 1;
        }
        self
    }

    pub fn failing(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::respond("")
        }
    }
}

#[derive(Clone)]
pub(crate) struct RecordedCall {
    pub prompt: String,
    pub trigger_type: String,
    pub metadata: HashMap<String, String>,
    pub history_len: usize,
}

/// Replays a fixed script, repeating the last step once exhausted.
pub(crate) struct ScriptedExecutor {
    steps: Mutex<VecDeque<ScriptStep>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_step(&self) -> ScriptStep {
        let mut steps = self.steps.lock();
        if steps.len() > 1 {
            steps.pop_front().unwrap_or_else(|| ScriptStep::respond(""))
        } else {
            steps.front().cloned().unwrap_or_else(|| ScriptStep::respond(""))
        }
    }
}

#[async_trait::async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> anyhow::Result<(RunResult, Vec<ChatMessage>)> {
        let index = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                prompt: request.prompt.clone(),
                trigger_type: request.trigger_type.clone(),
                metadata: request.trigger_metadata.clone(),
                history_len: request.message_history.as_ref().map_or(0, Vec::len),
            });
            calls.len()
        };

        let step = self.next_step();
        if step.latency > Duration::ZERO {
            tokio::time::sleep(step.latency).await;
        }

        for (tool, args) in &step.tool_invocations {
            for toolset in &request.toolsets {
                if toolset.owns(tool) {
                    toolset.invoke(tool, args.clone()).await?;
                    break;
                }
            }
        }

        let mut messages = request.message_history.unwrap_or_default();
        messages.push(ChatMessage::user(&request.prompt));
        messages.push(ChatMessage::assistant(&step.output));

        let result = RunResult {
            run_id: format!("r{index}"),
            output: step.output,
            tokens_in: step.tokens / 2,
            tokens_out: step.tokens - step.tokens / 2,
            total_tokens: step.tokens,
            tool_calls: step.tool_calls,
            success: step.success,
            error: step.error,
        };
        Ok((result, messages))
    }
}
