//! Live reply message — created on the first streamed text, edited at most
//! once per interval while the turn runs, then replaced by the final text.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use tether_types::protocol::AgentEvent;
use tether_types::turn::{CompletionReason, TurnResult};

use super::ChatApi;

/// Telegram's message length limit, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

pub struct LiveMessage {
    api: Arc<dyn ChatApi>,
    chat_id: i64,
    interval: Duration,
    message_id: Option<i64>,
    streamed: Vec<String>,
    shown: String,
    last_edit: Option<Instant>,
}

impl LiveMessage {
    pub fn new(api: Arc<dyn ChatApi>, chat_id: i64, interval: Duration) -> Self {
        Self {
            api,
            chat_id,
            interval,
            message_id: None,
            streamed: Vec::new(),
            shown: String::new(),
            last_edit: None,
        }
    }

    /// Fold one streamed event into the view and refresh it if due.
    pub async fn push(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TextDelta { text } => self.streamed.push(text.clone()),
            AgentEvent::ToolNotice { name, summary } if summary.is_empty() => {
                self.streamed.push(format!("[{name}]"))
            }
            AgentEvent::ToolNotice { name, summary } => {
                self.streamed.push(format!("[{name}] {summary}"))
            }
            _ => return,
        }
        let text = self.streamed.join("\n\n");
        self.refresh(&text).await;
    }

    async fn refresh(&mut self, text: &str) {
        if text.is_empty() || text == self.shown {
            return;
        }
        let now = Instant::now();
        match self.message_id {
            None => match self.api.send_text(self.chat_id, &truncate(text)).await {
                Ok(id) => self.message_id = Some(id),
                Err(e) => warn!("Failed to send live message to {}: {:#}", self.chat_id, e),
            },
            Some(id) => {
                let due = self
                    .last_edit
                    .map_or(true, |last| now.duration_since(last) >= self.interval);
                if !due {
                    return;
                }
                if let Err(e) = self.api.edit_text(self.chat_id, id, &truncate(text)).await {
                    warn!("Failed to edit live message in {}: {:#}", self.chat_id, e);
                }
            }
        }
        self.shown = text.to_string();
        self.last_edit = Some(now);
    }

    /// Replace the live view with the final reply, splitting long text over
    /// several messages.
    pub async fn finish(self, final_text: &str) {
        let chunks = split_message(final_text, MAX_MESSAGE_CHARS);
        let mut rest = chunks.as_slice();
        if let (Some(id), Some((first, tail))) = (self.message_id, chunks.split_first()) {
            if *first != self.shown {
                if let Err(e) = self.api.edit_text(self.chat_id, id, first).await {
                    warn!("Failed to finalize live message in {}: {:#}", self.chat_id, e);
                }
            }
            rest = tail;
        }
        for chunk in rest {
            if let Err(e) = self.api.send_text(self.chat_id, chunk).await {
                warn!("Failed to send reply to {}: {:#}", self.chat_id, e);
            }
        }
    }
}

/// What the user sees when the turn is over.
pub fn render_final(result: &TurnResult) -> String {
    let text = result.text.trim_end();
    match (result.completion, result.completion.user_notice()) {
        (CompletionReason::Completed, _) if text.is_empty() => "(empty response)".to_string(),
        (_, None) => text.to_string(),
        (_, Some(notice)) if text.is_empty() => notice.to_string(),
        (_, Some(notice)) => format!("{text}\n\n{notice}"),
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS - 4) {
        Some((idx, _)) => format!("{}\n...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// paragraph breaks, then line breaks.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        let window = &rest[..limit];
        let split_at = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .filter(|&at| at > 0)
            .unwrap_or(limit);
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
