//! Telegram trigger: long-polls the Bot API over outbound HTTPS, no ports
//! opened. Replies are chunked to the platform's 4096-character cap.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vigil_config::TelegramTriggerConfig;

use crate::{chunk_text, EventSender, ReplyFn, TriggerEvent};

const TELEGRAM_MAX_MESSAGE: usize = 4096;
const POLL_TIMEOUT_SECS: u32 = 25;

/// Union semantics: with any allow-list configured the sender must match at
/// least one of username or user id; with none configured everyone passes.
pub(crate) fn telegram_access_allowed(
    allowed_users: &[String],
    allowed_user_ids: &[i64],
    username: Option<&str>,
    user_id: Option<i64>,
) -> bool {
    if allowed_users.is_empty() && allowed_user_ids.is_empty() {
        return true;
    }
    let username_ok = username
        .map(|name| allowed_users.iter().any(|u| u == name))
        .unwrap_or(false);
    let user_id_ok = user_id
        .map(|id| allowed_user_ids.contains(&id))
        .unwrap_or(false);
    username_ok || user_id_ok
}

pub(crate) async fn run(
    config: TelegramTriggerConfig,
    events: EventSender,
    mut stop: watch::Receiver<bool>,
) {
    let token = match std::env::var(&config.token_env) {
        Ok(t) if !t.trim().is_empty() => t,
        _ => {
            error!(env = %config.token_env, "env var not set, telegram trigger not started");
            return;
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(u64::from(POLL_TIMEOUT_SECS) + 10))
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "failed to build telegram http client");
            return;
        }
    };
    let base_url = format!("https://api.telegram.org/bot{token}");
    let mut offset: i64 = 0;

    info!("telegram bot polling for updates");

    loop {
        let updates = tokio::select! {
            _ = crate::stopped(&mut stop) => return,
            fetched = fetch_updates(&client, &base_url, offset) => fetched,
        };

        let updates = match updates {
            Ok(u) => u,
            Err(err) => {
                let backoff = if err.to_string().contains("409") {
                    // Another instance is polling; back off and let it win.
                    warn!("telegram getUpdates conflict (409), waiting 15s");
                    Duration::from_secs(15)
                } else {
                    warn!(%err, "telegram getUpdates failed, retrying in 5s");
                    Duration::from_secs(5)
                };
                tokio::select! {
                    _ = crate::stopped(&mut stop) => return,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        for update in updates {
            offset = update.update_id + 1;

            let Some(message) = update.message else { continue };
            let Some(text) = message.text else { continue };

            let username = message.from.as_ref().and_then(|u| u.username.clone());
            let user_id = message.from.as_ref().map(|u| u.id);
            if !telegram_access_allowed(
                &config.allowed_users,
                &config.allowed_user_ids,
                username.as_deref(),
                user_id,
            ) {
                debug!(user = ?username, id = ?user_id, "telegram message rejected: sender not allowed");
                continue;
            }

            let chat_id = message.chat.id;
            let reply_fn = make_reply_fn(client.clone(), base_url.clone(), chat_id);
            let prompt = config.prompt_template.replace("{message}", &text);
            let event = TriggerEvent::new("telegram", prompt)
                .with_metadata("user", username.unwrap_or_default())
                .with_metadata("chat_id", chat_id.to_string())
                .with_metadata(
                    "user_id",
                    user_id.map(|id| id.to_string()).unwrap_or_default(),
                )
                .with_reply(reply_fn);
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

fn make_reply_fn(client: reqwest::Client, base_url: String, chat_id: i64) -> ReplyFn {
    Arc::new(move |text: String| {
        let client = client.clone();
        let base_url = base_url.clone();
        Box::pin(async move {
            for chunk in chunk_text(&text, TELEGRAM_MAX_MESSAGE) {
                send_message(&client, &base_url, chat_id, &chunk).await?;
            }
            Ok(())
        })
    })
}

async fn fetch_updates(
    client: &reqwest::Client,
    base_url: &str,
    offset: i64,
) -> anyhow::Result<Vec<TelegramUpdate>> {
    let url = format!("{base_url}/getUpdates");
    let response = client
        .get(url)
        .query(&[
            ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ("offset", offset.to_string()),
        ])
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
    if !payload.ok {
        anyhow::bail!(payload
            .description
            .unwrap_or_else(|| "telegram getUpdates failed".to_string()));
    }
    Ok(payload.result.unwrap_or_default())
}

async fn send_message(
    client: &reqwest::Client,
    base_url: &str,
    chat_id: i64,
    text: &str,
) -> anyhow::Result<()> {
    let url = format!("{base_url}/sendMessage");
    let body = SendMessageRequest {
        chat_id,
        text,
        disable_web_page_preview: true,
    };
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<serde_json::Value> = response.json().await?;
    if !payload.ok {
        anyhow::bail!(payload
            .description
            .unwrap_or_else(|| "telegram sendMessage failed".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
    from: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_filters_allow_everyone() {
        assert!(telegram_access_allowed(&[], &[], Some("alice"), Some(1)));
        assert!(telegram_access_allowed(&[], &[], None, None));
    }

    #[test]
    fn username_filter_alone() {
        let users = vec!["alice".to_string()];
        assert!(telegram_access_allowed(&users, &[], Some("alice"), Some(1)));
        assert!(!telegram_access_allowed(&users, &[], Some("bob"), Some(1)));
        assert!(!telegram_access_allowed(&users, &[], None, Some(1)));
    }

    #[test]
    fn user_id_filter_alone() {
        let ids = vec![42i64];
        assert!(telegram_access_allowed(&[], &ids, None, Some(42)));
        assert!(!telegram_access_allowed(&[], &ids, Some("alice"), Some(7)));
    }

    #[test]
    fn union_of_username_and_id() {
        let users = vec!["alice".to_string()];
        let ids = vec![42i64];
        // Matching either side passes.
        assert!(telegram_access_allowed(&users, &ids, Some("alice"), Some(7)));
        assert!(telegram_access_allowed(&users, &ids, Some("bob"), Some(42)));
        assert!(!telegram_access_allowed(&users, &ids, Some("bob"), Some(7)));
    }

    #[test]
    fn update_envelope_parses() {
        let raw = r#"{"ok":true,"result":[{"update_id":7,"message":{"chat":{"id":5},"text":"hi","from":{"id":9,"username":"alice"}}}]}"#;
        let payload: TelegramResponse<Vec<TelegramUpdate>> = serde_json::from_str(raw).unwrap();
        assert!(payload.ok);
        let updates = payload.result.unwrap();
        assert_eq!(updates[0].update_id, 7);
        let msg = updates[0].message.as_ref().unwrap();
        assert_eq!(msg.chat.id, 5);
        assert_eq!(msg.from.as_ref().unwrap().username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn missing_token_env_does_not_start() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = TelegramTriggerConfig {
            token_env: "VIGIL_TEST_NO_SUCH_TOKEN".to_string(),
            ..Default::default()
        };
        run(config, tx, stop_rx).await; // returns immediately
        assert!(rx.try_recv().is_err());
    }
}
