//! Trigger configuration: one variant per event source, discriminated on
//! `type`. Unrecognized types deserialize to [`TriggerConfig::Unknown`] and
//! are skipped when drivers are built, so a role file written for a newer
//! build still loads.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Cron(CronTriggerConfig),
    FileWatch(FileWatchTriggerConfig),
    Webhook(WebhookTriggerConfig),
    Telegram(TelegramTriggerConfig),
    Discord(DiscordTriggerConfig),
    #[serde(other)]
    Unknown,
}

impl TriggerConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::FileWatch(_) => "file_watch",
            Self::Webhook(_) => "webhook",
            Self::Telegram(_) => "telegram",
            Self::Discord(_) => "discord",
            Self::Unknown => "unknown",
        }
    }

    pub fn autonomous(&self) -> bool {
        match self {
            Self::Cron(c) => c.autonomous,
            Self::FileWatch(c) => c.autonomous,
            Self::Webhook(c) => c.autonomous,
            Self::Telegram(c) => c.autonomous,
            Self::Discord(c) => c.autonomous,
            Self::Unknown => false,
        }
    }

    /// One-line description for the startup banner.
    pub fn summary(&self) -> String {
        match self {
            Self::Cron(c) => format!("cron: {}", c.schedule),
            Self::FileWatch(c) => format!("file_watch: {}", c.paths.join(", ")),
            Self::Webhook(c) => format!("webhook: :{}{}", c.port, c.path),
            Self::Telegram(c) => {
                if c.allowed_users.is_empty() && c.allowed_user_ids.is_empty() {
                    "telegram: users=all".to_string()
                } else {
                    format!("telegram: users={}", c.allowed_users.join(", "))
                }
            }
            Self::Discord(c) => {
                if c.channel_ids.is_empty() {
                    "discord: all channels (mention/DM)".to_string()
                } else {
                    format!("discord: channels={}", c.channel_ids.join(", "))
                }
            }
            Self::Unknown => "unknown (skipped)".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron(c) => {
                if c.schedule.trim().is_empty() {
                    bail!("cron trigger requires a schedule");
                }
            }
            Self::FileWatch(c) => {
                if c.paths.is_empty() {
                    bail!("file_watch trigger requires at least one path");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTriggerConfig {
    pub schedule: String,
    pub prompt: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub autonomous: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWatchTriggerConfig {
    pub paths: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_file_prompt")]
    pub prompt_template: String,
    #[serde(default = "default_debounce")]
    pub debounce_seconds: f64,
    /// Emit one event per existing file at startup before watching.
    #[serde(default)]
    pub process_existing: bool,
    #[serde(default)]
    pub autonomous: bool,
}

fn default_file_prompt() -> String {
    "File changed: {path}".to_string()
}

fn default_debounce() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookTriggerConfig {
    pub path: String,
    pub port: u16,
    pub method: String,
    /// HMAC-SHA256 signing secret. Auto-generated when absent so an
    /// unconfigured webhook is never unauthenticated by accident.
    pub secret: Option<String>,
    pub rate_limit_rpm: u32,
    pub autonomous: bool,
}

impl Default for WebhookTriggerConfig {
    fn default() -> Self {
        Self {
            path: "/webhook".to_string(),
            port: 8080,
            method: "POST".to_string(),
            secret: Some(generate_secret()),
            rate_limit_rpm: 60,
            autonomous: false,
        }
    }
}

impl WebhookTriggerConfig {
    /// Returns the signing secret, generating one on first access if the
    /// role file left it null.
    pub fn secret_or_generated(&self) -> String {
        self.secret.clone().unwrap_or_else(generate_secret)
    }
}

fn generate_secret() -> String {
    // Two v4 uuids give 244 bits of OS randomness in a URL-safe encoding.
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramTriggerConfig {
    pub token_env: String,
    pub allowed_users: Vec<String>,
    pub allowed_user_ids: Vec<i64>,
    pub prompt_template: String,
    pub autonomous: bool,
}

impl Default for TelegramTriggerConfig {
    fn default() -> Self {
        Self {
            token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            allowed_users: Vec::new(),
            allowed_user_ids: Vec::new(),
            prompt_template: "{message}".to_string(),
            autonomous: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordTriggerConfig {
    pub token_env: String,
    pub channel_ids: Vec<String>,
    pub allowed_roles: Vec<String>,
    pub allowed_user_ids: Vec<String>,
    pub prompt_template: String,
    pub autonomous: bool,
}

impl Default for DiscordTriggerConfig {
    fn default() -> Self {
        Self {
            token_env: "DISCORD_BOT_TOKEN".to_string(),
            channel_ids: Vec::new(),
            allowed_roles: Vec::new(),
            allowed_user_ids: Vec::new(),
            prompt_template: "{message}".to_string(),
            autonomous: false,
        }
    }
}
