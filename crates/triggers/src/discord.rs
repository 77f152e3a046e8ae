//! Discord trigger: a gateway (WebSocket) client, outbound only. The bot
//! answers DMs and messages that mention it; replies are chunked to the
//! platform's 2000-character cap.

use std::collections::HashSet;
use std::sync::Arc;

use serenity::all::{
    Client, Context, EventHandler, GatewayIntents, Message, Ready,
};
use serenity::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vigil_config::DiscordTriggerConfig;

use crate::{chunk_text, EventSender, ReplyFn, TriggerEvent};

const DISCORD_MAX_MESSAGE: usize = 2000;

/// Access rules for a single message.
///
/// DMs: user-id allow-list applies when configured; a roles-only
/// configuration denies DMs because there is no role context outside a
/// guild. Guild messages: channel filter first, then union of roles and
/// user ids when either is configured.
pub(crate) fn check_discord_access(
    is_dm: bool,
    author_roles: &HashSet<String>,
    author_id: &str,
    channel_id: &str,
    allowed_channels: &[String],
    allowed_roles: &[String],
    allowed_user_ids: &[String],
) -> bool {
    let user_id_passed =
        !allowed_user_ids.is_empty() && allowed_user_ids.iter().any(|id| id == author_id);

    if is_dm {
        if !allowed_roles.is_empty() && allowed_user_ids.is_empty() {
            return false;
        }
        if !allowed_user_ids.is_empty() && !user_id_passed {
            return false;
        }
        return true;
    }

    if !allowed_channels.is_empty() && !allowed_channels.iter().any(|c| c == channel_id) {
        return false;
    }

    if !allowed_roles.is_empty() || !allowed_user_ids.is_empty() {
        let role_passed =
            !allowed_roles.is_empty() && allowed_roles.iter().any(|r| author_roles.contains(r));
        if !role_passed && !user_id_passed {
            return false;
        }
    }

    true
}

/// Strip the bot's raw mention tokens (`<@id>` and `<@!id>`) from a message.
pub(crate) fn strip_mention(content: &str, bot_id: u64) -> String {
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

struct Handler {
    config: DiscordTriggerConfig,
    events: EventSender,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, "discord bot connected");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let bot_id = ctx.cache.current_user().id;
        let is_dm = msg.guild_id.is_none();
        let is_mentioned = msg.mentions_user_id(bot_id);
        if !is_dm && !is_mentioned {
            return;
        }

        // Role names resolve through the guild cache; DMs have none.
        let mut author_roles: HashSet<String> = HashSet::new();
        if let (Some(guild_id), Some(member)) = (msg.guild_id, msg.member.as_deref()) {
            if let Some(guild) = ctx.cache.guild(guild_id) {
                for role_id in &member.roles {
                    if let Some(role) = guild.roles.get(role_id) {
                        author_roles.insert(role.name.clone());
                    }
                }
            }
        }

        let author_id = msg.author.id.get().to_string();
        let channel_id = msg.channel_id.get().to_string();
        if !check_discord_access(
            is_dm,
            &author_roles,
            &author_id,
            &channel_id,
            &self.config.channel_ids,
            &self.config.allowed_roles,
            &self.config.allowed_user_ids,
        ) {
            debug!(user = %msg.author.name, id = %author_id, "discord message rejected");
            return;
        }

        let content = strip_mention(&msg.content, bot_id.get());
        let prompt = self.config.prompt_template.replace("{message}", &content);

        let http = ctx.http.clone();
        let target = msg.channel_id;
        let reply_fn: ReplyFn = Arc::new(move |text: String| {
            let http = http.clone();
            Box::pin(async move {
                for chunk in chunk_text(&text, DISCORD_MAX_MESSAGE) {
                    target.say(&http, chunk).await?;
                }
                Ok(())
            })
        });

        let event = TriggerEvent::new("discord", prompt)
            .with_metadata("user", &msg.author.name)
            .with_metadata("channel_id", channel_id)
            .with_metadata("user_id", author_id)
            .with_reply(reply_fn);
        if self.events.send(event).await.is_err() {
            warn!("event channel closed, dropping discord message");
        }
    }
}

pub(crate) async fn run(
    config: DiscordTriggerConfig,
    events: EventSender,
    mut stop: watch::Receiver<bool>,
) {
    let token = match std::env::var(&config.token_env) {
        Ok(t) if !t.trim().is_empty() => t,
        _ => {
            error!(env = %config.token_env, "env var not set, discord trigger not started");
            return;
        }
    };

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = match Client::builder(&token, intents)
        .event_handler(Handler { config, events })
        .await
    {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "failed to build discord client, trigger not started");
            return;
        }
    };

    // Close the gateway when the stop flag flips so start() returns.
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        crate::stopped(&mut stop).await;
        shard_manager.shutdown_all().await;
    });

    if let Err(err) = client.start().await {
        error!(%err, "discord client error");
    }
}
