//! LLM collaborator contract: chat messages, run results, the executor
//! trait the daemon drives, and an OpenAI-compatible provider adapter.
//!
//! The daemon never talks to a model API directly: it hands an
//! [`ExecuteRequest`] to an [`AgentExecutor`] and gets back a [`RunResult`]
//! plus the updated message history. Anything that satisfies that contract
//! (the bundled provider, a test double) plugs in.

mod provider;
mod toolset;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use provider::OpenAiProvider;
pub use toolset::{specs_to_openai_tools, ParamKind, ToolParam, ToolSpec, Toolset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation, in the provider-neutral internal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: output.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// True for messages that can open a trimmed history (a request, not a
    /// model response or a dangling tool result).
    pub fn is_request(&self) -> bool {
        matches!(self.role, MessageRole::System | MessageRole::User)
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of one LLM iteration (one `execute` call).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub tool_calls: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn failed(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            output: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            total_tokens: 0,
            tool_calls: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Everything an executor needs for one iteration.
pub struct ExecuteRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub message_history: Option<Vec<ChatMessage>>,
    pub trigger_type: String,
    pub trigger_metadata: HashMap<String, String>,
    pub toolsets: Vec<Arc<dyn Toolset>>,
}

impl ExecuteRequest {
    pub fn new(system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            message_history: None,
            trigger_type: "manual".to_string(),
            trigger_metadata: HashMap::new(),
            toolsets: Vec::new(),
        }
    }
}

/// The synchronous-per-call contract the daemon and the autonomous loop
/// drive. Implementations run the model (including any native tool-call
/// rounds) to a final text answer and return the full updated history.
///
/// Model-level failures are reported in-band (`RunResult::success == false`)
/// so callers keep the partial history; only transport-level breakage that
/// leaves no usable result should surface as `Err`.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> anyhow::Result<(RunResult, Vec<ChatMessage>)>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key env var {0} is not set")]
    MissingApiKey(String),
    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model response had no choices")]
    EmptyResponse,
}
