//! OpenAI-compatible chat-completions provider.
//!
//! Sends the conversation plus tool schemas, executes any `tool_calls` the
//! model requests against the supplied toolsets, feeds results back as
//! tool-role messages, and repeats until the model produces a plain text
//! answer. On the last allowed round the tools are withheld to force a text
//! response.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    specs_to_openai_tools, AgentExecutor, ChatMessage, ExecuteRequest, LlmError, MessageRole,
    RunResult, ToolCall, Toolset,
};

const MAX_TOOL_ROUNDS: usize = 5;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    /// Read the API key from the named env var. Missing keys are an error
    /// only for hosted endpoints; local servers commonly need none.
    pub fn from_env(
        base_url: impl Into<String>,
        api_key_env: &str,
        model: impl Into<String>,
    ) -> Self {
        let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
        Self::new(base_url, api_key, model)
    }

    async fn chat_round(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> anyhow::Result<(ApiChoiceMessage, ApiUsage)> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if let Some(tools) = tools {
            body["tools"] = tools.clone();
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let parsed: ApiResponse = resp.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?;
        Ok((choice.message, parsed.usage.unwrap_or_default()))
    }
}

#[async_trait::async_trait]
impl AgentExecutor for OpenAiProvider {
    async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> anyhow::Result<(RunResult, Vec<ChatMessage>)> {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();

        let mut messages = match request.message_history {
            Some(history) if !history.is_empty() => history,
            _ => vec![ChatMessage::system(&request.system_prompt)],
        };
        messages.push(ChatMessage::user(&request.prompt));

        let specs: Vec<_> = request.toolsets.iter().flat_map(|t| t.specs()).collect();
        let tools_json = if specs.is_empty() {
            None
        } else {
            Some(specs_to_openai_tools(&specs))
        };

        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut executed_calls = 0u32;
        let mut output = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            // Withhold tools on the final round to force a text answer.
            let effective_tools = if round < MAX_TOOL_ROUNDS - 1 {
                tools_json.as_ref()
            } else {
                warn!(max_rounds = MAX_TOOL_ROUNDS, "tool loop hit max rounds, forcing text response");
                None
            };

            let (reply, usage) = match self.chat_round(&messages, effective_tools).await {
                Ok(pair) => pair,
                Err(err) => {
                    // Report in-band so the caller keeps the partial history.
                    let mut result = RunResult::failed(&run_id, err.to_string());
                    result.tokens_in = tokens_in;
                    result.tokens_out = tokens_out;
                    result.total_tokens = tokens_in + tokens_out;
                    result.tool_calls = executed_calls;
                    return Ok((result, messages));
                }
            };
            tokens_in += usage.prompt_tokens;
            tokens_out += usage.completion_tokens;

            let calls = reply.tool_calls.unwrap_or_default();
            if calls.is_empty() {
                output = reply.content.unwrap_or_default();
                messages.push(ChatMessage::assistant(&output));
                break;
            }

            debug!(round, count = calls.len(), "model requested tool calls");
            let parsed: Vec<ToolCall> = calls.iter().map(ApiToolCall::to_internal).collect();
            messages.push(ChatMessage::assistant_tool_calls(parsed.clone()));

            for call in &parsed {
                let result = invoke_tool(&request.toolsets, call).await;
                messages.push(ChatMessage::tool_result(&call.id, result));
                executed_calls += 1;
            }
        }

        let result = RunResult {
            run_id,
            output,
            tokens_in,
            tokens_out,
            total_tokens: tokens_in + tokens_out,
            tool_calls: executed_calls,
            success: true,
            error: None,
        };
        Ok((result, messages))
    }
}

async fn invoke_tool(toolsets: &[std::sync::Arc<dyn Toolset>], call: &ToolCall) -> String {
    for toolset in toolsets {
        if toolset.owns(&call.name) {
            return match toolset.invoke(&call.name, call.arguments.clone()).await {
                Ok(text) => text,
                Err(err) => format!("Tool {} failed: {err}", call.name),
            };
        }
    }
    format!("Unknown tool: {}", call.name)
}

fn wire_message(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut value = serde_json::json!({ "role": role, "content": msg.content });
    if !msg.tool_calls.is_empty() {
        value["tool_calls"] = msg
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    },
                })
            })
            .collect();
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = serde_json::json!(id);
    }
    value
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

impl ApiToolCall {
    fn to_internal(&self) -> ToolCall {
        // Providers send arguments as a JSON-encoded string.
        let arguments = serde_json::from_str(&self.function.arguments)
            .unwrap_or(serde_json::Value::Null);
        ToolCall {
            id: self.id.clone(),
            name: self.function.name.clone(),
            arguments,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
