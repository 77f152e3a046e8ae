//! Role definitions: the declarative document that turns into a live agent
//! daemon. A role file is a kubernetes-style YAML document
//! (`apiVersion`/`kind`/`metadata`/`spec`) describing the system prompt, the
//! model, the triggers to listen on, and the guardrails/autonomy policy.

mod autonomy;
mod guardrails;
mod triggers;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub use autonomy::AutonomyConfig;
pub use guardrails::Guardrails;
pub use triggers::{
    CronTriggerConfig, DiscordTriggerConfig, FileWatchTriggerConfig, TelegramTriggerConfig,
    TriggerConfig, WebhookTriggerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    #[serde(rename = "v1")]
    V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Which model serves this role. `base_url` and `api_key_env` cover
/// OpenAI-compatible endpoints (local or hosted).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            name: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub data_dir: String,
    /// Episodes older than this are pruned opportunistically after runs.
    pub retain_episodes_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: ".vigil".to_string(),
            retain_episodes_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Console,
    File { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// System prompt for the agent.
    pub role: String,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub autonomy: Option<AutonomyConfig>,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(rename = "apiVersion")]
    pub api_version: ApiVersion,
    pub kind: Kind,
    pub metadata: Metadata,
    pub spec: AgentSpec,
}

impl RoleDefinition {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read role definition {}", path.display()))?;
        let role: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse role definition {}", path.display()))?;
        role.validate()?;
        Ok(role)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            bail!("metadata.name must not be empty");
        }
        if self.spec.role.trim().is_empty() {
            bail!("spec.role (system prompt) must not be empty");
        }
        for trigger in &self.spec.triggers {
            trigger.validate()?;
        }
        Ok(())
    }

    /// Trigger types that run the autonomous loop, per the `autonomous` flag
    /// on each trigger. Self-scheduled follow-ups always qualify.
    pub fn autonomous_trigger_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .spec
            .triggers
            .iter()
            .filter(|t| t.autonomous())
            .map(|t| t.type_name().to_string())
            .collect();
        types.push("scheduled".to_string());
        types.dedup();
        types
    }
}
