//! Chat channel plumbing: the traits the core talks to, and the Telegram
//! implementation of them.

pub mod commands;
pub mod dispatch;
pub mod live;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use tether_types::session::ConversationId;

/// Delivers a standalone message to a conversation.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, id: ConversationId, text: &str) -> Result<()>;
}

/// The message operations live replies need.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a message and return its id.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64>;

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()>;

    /// Show the typing indicator. Failures are logged, never returned.
    async fn send_typing(&self, chat_id: i64);
}
