//! Telegram Bot API channel adapter.
//!
//! Runs long polling in a background task and exposes the send/edit calls the
//! dispatcher and the crash-recovery notice need.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_types::session::ConversationId;

use super::{ChatApi, ChatNotifier};
use crate::channels::live::{split_message, MAX_MESSAGE_CHARS};

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
const TYPING_REFRESH: Duration = Duration::from_secs(4);

/// Inbound text message from an allowed user.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
    pub message_id: i64,
}

// ── Telegram API types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgSent {
    message_id: i64,
}

// ── Client ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<TgUpdate>> {
        let resp: TgResponse<Vec<TgUpdate>> = self
            .client
            .get(self.url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await?
            .json()
            .await?;
        into_result(resp)
    }

    /// Call `method` with Markdown, retrying as plain text when Telegram
    /// rejects the formatting.
    async fn post_with_fallback<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        mut params: serde_json::Value,
    ) -> Result<T> {
        params["parse_mode"] = serde_json::json!("Markdown");
        let resp: TgResponse<T> = self
            .client
            .post(self.url(method))
            .json(&params)
            .send()
            .await?
            .json()
            .await?;
        if resp.ok {
            return into_result(resp);
        }
        debug!(
            "Telegram {} rejected Markdown ({}), retrying as plain text",
            method,
            resp.description.unwrap_or_default()
        );
        if let Some(obj) = params.as_object_mut() {
            obj.remove("parse_mode");
        }
        let resp: TgResponse<T> = self
            .client
            .post(self.url(method))
            .json(&params)
            .send()
            .await?
            .json()
            .await?;
        into_result(resp)
    }
}

fn into_result<T>(resp: TgResponse<T>) -> Result<T> {
    if !resp.ok {
        anyhow::bail!("Telegram API error: {}", resp.description.unwrap_or_default());
    }
    resp.result
        .ok_or_else(|| anyhow::anyhow!("Telegram API returned no result"))
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64> {
        let sent: TgSent = self
            .post_with_fallback(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": text }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let edited: Result<serde_json::Value> = self
            .post_with_fallback(
                "editMessageText",
                serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
            )
            .await;
        match edited {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, chat_id: i64) {
        let params = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        match self.client.post(self.url("sendChatAction")).json(&params).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("sendChatAction failed: HTTP {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => warn!("sendChatAction error: {e}"),
        }
    }
}

#[async_trait]
impl ChatNotifier for TelegramClient {
    async fn notify(&self, id: ConversationId, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.send_text(id.0, &chunk).await?;
        }
        Ok(())
    }
}

// ── Polling ─────────────────────────────────────────────────────────────

/// Start long polling. Messages from users outside `allowed_user_ids` are
/// dropped; polling stops when `shutdown` fires.
pub fn start_polling(
    client: TelegramClient,
    allowed_user_ids: Vec<i64>,
    shutdown: CancellationToken,
) -> mpsc::UnboundedReceiver<InboundMessage> {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut offset: i64 = 0;
        info!("Telegram adapter started (long polling)");

        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => break,
                updates = client.get_updates(offset) => updates,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(inbound) = to_inbound(update, &allowed_user_ids) else {
                            continue;
                        };
                        if inbound_tx.send(inbound).is_err() {
                            error!("Telegram inbound channel closed");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Telegram polling error: {e:#}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }
        info!("Telegram polling stopped");
    });

    inbound_rx
}

fn to_inbound(update: TgUpdate, allowed_user_ids: &[i64]) -> Option<InboundMessage> {
    let msg = update.message?;
    let user_id = msg.from.as_ref().map(|u| u.id)?;
    if !allowed_user_ids.contains(&user_id) {
        debug!("Telegram: ignoring message from unauthorized user {user_id}");
        return None;
    }
    let text = msg.text.filter(|t| !t.trim().is_empty())?;
    Some(InboundMessage {
        chat_id: msg.chat.id,
        user_id,
        text,
        message_id: msg.message_id,
    })
}

/// Send "typing" now and every few seconds until the returned token is
/// cancelled or dropped by the caller.
pub fn spawn_typing_loop<A: ChatApi + ?Sized + 'static>(
    api: std::sync::Arc<A>,
    chat_id: i64,
) -> tokio_util::sync::DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();
    tokio::spawn(async move {
        loop {
            api.send_typing(chat_id).await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(TYPING_REFRESH) => {}
            }
        }
    });
    guard
}
