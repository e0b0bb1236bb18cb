//! Push delivery of the nightly summary through the Telegram Bot API.
//!
//! Credentials come from environment variables named in [`NotifyConfig`];
//! the config file only ever holds the variable names.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;
use vaultintel_shared::{NotifyConfig, Result, VaultIntelError};

/// Telegram rejects messages above 4096 characters; stay clear of it.
const MAX_MESSAGE_CHARS: usize = 4000;
const TRUNCATED_KEEP_CHARS: usize = 3980;
const TRUNCATION_MARKER: &str = "\n\n... (truncated)";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Shorten `text` to fit a single message, marking the cut.
pub fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut kept: String = text.chars().take(TRUNCATED_KEEP_CHARS).collect();
    kept.push_str(TRUNCATION_MARKER);
    kept
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    endpoint: Url,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&format!(
            "{}/bot{token}/sendMessage",
            api_base.trim_end_matches('/')
        ))
        .map_err(|e| VaultIntelError::config(format!("invalid notify api_base: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultIntelError::Notify(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            chat_id: chat_id.to_string(),
        })
    }

    /// Build from config, reading the credentials from the process environment.
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Build from config with an explicit variable lookup.
    pub fn from_lookup(
        config: &NotifyConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| VaultIntelError::Notify(format!("{name} is not set")))
        };
        let token = read(&config.bot_token_env)?;
        let chat_id = read(&config.chat_id_env)?;
        Self::new(
            &config.api_base,
            &token,
            &chat_id,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Send `text` as one message, truncated if needed.
    #[instrument(skip_all, fields(chars = text.chars().count()))]
    pub async fn send(&self, text: &str) -> Result<()> {
        let text = truncate_message(text);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            // Strip the URL: it embeds the bot token.
            .map_err(|e| VaultIntelError::Notify(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        let parsed: Option<ApiResponse> = response.json().await.ok();
        match parsed {
            Some(ApiResponse { ok: true, .. }) => {
                debug!("notification delivered");
                Ok(())
            }
            Some(ApiResponse { description, .. }) => Err(VaultIntelError::Notify(format!(
                "telegram rejected message ({status}): {}",
                description.unwrap_or_else(|| "no description".into())
            ))),
            None => Err(VaultIntelError::Notify(format!(
                "unexpected response from telegram ({status})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(api_base: &str) -> NotifyConfig {
        NotifyConfig {
            api_base: api_base.to_string(),
            ..NotifyConfig::default()
        }
    }

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".into()),
            "TELEGRAM_ALLOWED_CHAT_ID" => Some("42".into()),
            _ => None,
        }
    }

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate_message("Vault Intel: Score 90/100"), "Vault Intel: Score 90/100");
    }

    #[test]
    fn long_messages_are_cut_with_marker() {
        let long = "é".repeat(5000);
        let cut = truncate_message(&long);
        assert!(cut.ends_with("\n\n... (truncated)"));
        assert_eq!(cut.chars().count(), 3980 + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn missing_credentials_are_a_notify_error() {
        let err = TelegramNotifier::from_lookup(&config("https://api.telegram.org"), |_| None)
            .unwrap_err();
        assert!(matches!(err, VaultIntelError::Notify(_)));
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[tokio::test]
    async fn sends_message_to_bot_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(serde_json::json!({"chat_id": "42", "text": "Vault Intel 2025-10-14"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::from_lookup(&config(&server.uri()), lookup).unwrap();
        notifier.send("Vault Intel 2025-10-14").await.unwrap();
    }

    #[tokio::test]
    async fn api_rejection_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                serde_json::json!({"ok": false, "description": "Bad Request: chat not found"}),
            ))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::from_lookup(&config(&server.uri()), lookup).unwrap();
        let err = notifier.send("hello").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
