use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{Notifier, QuietHours, Severity};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
}

/// Telegram Bot API notifier (`sendMessage`)
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    prefix: String,
    quiet_hours: Option<QuietHours>,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str, prefix: &str, quiet_hours: Option<QuietHours>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            prefix: prefix.to_string(),
            quiet_hours,
        }
    }

    /// Point at a different Bot API host
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn format(&self, message: &str, severity: Severity) -> String {
        let icon = match severity {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
            Severity::Critical => "🚨",
        };
        format!("[{}] {} {}", self.prefix, icon, message)
    }

    async fn send(&self, text: String) -> Result<(), reqwest::Error> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        self.client
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str, severity: Severity) {
        if let Some(quiet) = &self.quiet_hours {
            if quiet.suppresses(severity, Local::now().time()) {
                tracing::debug!("🔕 Quiet hours, suppressed [{}] {}", severity, message);
                return;
            }
        }

        if let Err(e) = self.send(self.format(message, severity)).await {
            // Never let a delivery failure reach the trading path
            tracing::warn!("Failed to deliver Telegram notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_sends_prefixed_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": "42",
                "text": "[upbit] 🚨 stop-loss executed"
            })))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new("TOKEN", "42", "upbit", None).with_api_base(&server.url());
        notifier.notify("stop-loss executed", Severity::Critical).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(500)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new("TOKEN", "42", "upbit", None).with_api_base(&server.url());
        notifier.notify("hello", Severity::Info).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_quiet_hours_hold_back_non_critical() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .expect(1)
            .with_status(200)
            .create_async()
            .await;

        // Whole-day window: everything but CRITICAL is suppressed
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let always = QuietHours::new(midnight, NaiveTime::from_hms_opt(23, 59, 59).unwrap());
        let notifier = TelegramNotifier::new("TOKEN", "42", "upbit", Some(always))
            .with_api_base(&server.url());

        // 23:59:59 exactly is outside the window; tolerate that one second
        if always.contains(Local::now().time()) {
            notifier.notify("hourly report", Severity::Info).await;
            notifier.notify("order failed", Severity::Error).await;
        }
        notifier.notify("stop-loss executed", Severity::Critical).await;

        mock.assert_async().await;
    }
}
