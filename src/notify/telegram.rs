// =============================================================================
// Telegram channel — sendMessage over the Bot API
// =============================================================================
//
// The bot token never appears in logs; request failures surface as errors to
// the notifier worker, which owns the retry policy.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::notify::{Notification, NotifyChannel, Priority};

pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            bot_token,
            chat_id,
            client,
        }
    }

    /// Prefix the content with a severity marker so priorities are scannable
    /// in the chat.
    fn format(notification: &Notification) -> String {
        let prefix = match notification.priority {
            Priority::Emergency => "🚨 EMERGENCY",
            Priority::High => "⚠️",
            Priority::Normal => "ℹ️",
        };
        format!("{prefix} {}", notification.content)
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": Self::format(notification),
            "disable_web_page_preview": true,
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram sendMessage returned {status}: {text}");
        }

        debug!(priority = ?notification.priority, "telegram notification delivered");
        Ok(())
    }
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}
