use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use reqwest::blocking::{Client, multipart};
use serde::Serialize;
use serde_json::json;

use crate::config::{NotificationSettings, constants};
use crate::snapshot::SnapshotRef;

/// Payload delivered to every enabled transport on emergency stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub reason: String,
    pub confidence: Option<f32>,
    pub snapshot_reference: Option<SnapshotRef>,
    pub layer: Option<u32>,
    pub progress: f32,
}

impl FailureNotice {
    /// Markdown body shared by the chat transports.
    pub fn describe(&self) -> String {
        let mut text = format!("**Reason:** {}", self.reason);
        if let Some(confidence) = self.confidence {
            text.push_str(&format!("\n**Confidence:** {:.0}%", confidence * 100.0));
        }
        let layer = self.layer.map_or_else(|| "?".to_string(), |l| l.to_string());
        text.push_str(&format!("\n**Layer:** {}\n**Progress:** {:.1}%", layer, self.progress));
        text.push_str("\n\nThe print has been cancelled.");
        text
    }
}

/// One way of telling the operator that a print was stopped.
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the notice, attaching the snapshot when one is available.
    fn send(&self, notice: &FailureNotice, image: Option<&[u8]>) -> Result<()>;
}

/// Fan-out over every enabled transport.
///
/// A failing transport is logged and never prevents delivery to the others.
#[derive(Default)]
pub struct Notifier {
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the transports enabled in `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared HTTP client cannot be initialised.
    pub fn from_settings(settings: &NotificationSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(constants::NOTIFICATION_TIMEOUT_SECONDS))
            .build()
            .context("building notification HTTP client")?;

        let mut notifier = Notifier::new();
        if settings.popup {
            notifier = notifier.with_channel(PopupChannel);
        }
        if let Some(url) = &settings.webhook_url {
            notifier = notifier.with_channel(WebhookChannel::new(url.clone(), client.clone()));
        }
        if let Some(url) = &settings.discord_webhook {
            notifier = notifier.with_channel(DiscordChannel::new(url.clone(), client.clone()));
        }
        if let Some(telegram) = &settings.telegram {
            notifier = notifier.with_channel(TelegramChannel::new(
                telegram.bot_token.clone(),
                telegram.chat_id.clone(),
                client,
            ));
        }
        Ok(notifier)
    }

    pub fn with_channel(mut self, channel: impl NotificationChannel + 'static) -> Self {
        self.channels.push(Box::new(channel));
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Send `notice` to every transport; returns how many succeeded.
    pub fn notify_failure(&self, notice: &FailureNotice, image: Option<&[u8]>) -> usize {
        let mut delivered = 0;
        for channel in &self.channels {
            match channel.send(notice, image) {
                Ok(()) => {
                    info!("Sent {} failure notification", channel.name());
                    delivered += 1;
                }
                Err(e) => error!("Failed to send {} notification: {:#}", channel.name(), e),
            }
        }
        delivered
    }
}

/// Host-native popup. The standalone daemon has no UI of its own, so the
/// popup is rendered as an error-level log line.
pub struct PopupChannel;

impl NotificationChannel for PopupChannel {
    fn name(&self) -> &str {
        "popup"
    }

    fn send(&self, notice: &FailureNotice, _image: Option<&[u8]>) -> Result<()> {
        error!(
            "PRINT FAILURE: {} (layer {:?}, {:.1}%)",
            notice.reason, notice.layer, notice.progress
        );
        Ok(())
    }
}

/// Generic webhook receiving a JSON POST (Home Assistant, IFTTT, ...).
pub struct WebhookChannel {
    url: String,
    client: Client,
}

impl WebhookChannel {
    pub fn new(url: String, client: Client) -> Self {
        Self { url, client }
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, notice: &FailureNotice, _image: Option<&[u8]>) -> Result<()> {
        let body = json!({
            "event": "print_failure",
            "plugin": "print-sentinel",
            "reason": notice.reason,
            "confidence": notice.confidence,
            "snapshot": notice.snapshot_reference,
            "layer": notice.layer,
            "progress": notice.progress,
        });
        let response = self.client.post(&self.url).json(&body).send()?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Webhook returned HTTP {}", response.status()));
        }
        Ok(())
    }
}

/// Discord webhook with a rich embed and optional JPEG attachment.
pub struct DiscordChannel {
    webhook_url: String,
    client: Client,
}

impl DiscordChannel {
    const TITLE: &'static str = "🚨 Print Failure Detected";
    const COLOR: u32 = 0xFF0000;

    pub fn new(webhook_url: String, client: Client) -> Self {
        Self { webhook_url, client }
    }

    fn embed(description: &str, attachment: Option<&str>) -> serde_json::Value {
        let mut embed = json!({
            "title": Self::TITLE,
            "description": description,
            "color": Self::COLOR,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "footer": { "text": "Print Sentinel" }
        });
        if let Some(filename) = attachment {
            embed["image"] = json!({ "url": format!("attachment://{}", filename) });
        }
        json!({ "embeds": [embed] })
    }
}

impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    fn send(&self, notice: &FailureNotice, image: Option<&[u8]>) -> Result<()> {
        let description = notice.describe();

        let response = match image {
            Some(image_data) => {
                let filename = format!("failure_{}.jpg", chrono::Utc::now().timestamp());
                let payload = Self::embed(&description, Some(&filename));
                let form = multipart::Form::new()
                    .text("payload_json", payload.to_string())
                    .part(
                        "files[0]",
                        multipart::Part::bytes(image_data.to_vec())
                            .file_name(filename)
                            .mime_str("image/jpeg")?,
                    );
                self.client.post(&self.webhook_url).multipart(form).send()?
            }
            None => self
                .client
                .post(&self.webhook_url)
                .json(&Self::embed(&description, None))
                .send()?,
        };

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to send Discord alert: HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }
}

/// Telegram Bot API: `sendPhoto` with the snapshot, `sendMessage` without.
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    api_base: String,
    client: Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String, client: Client) -> Self {
        Self {
            bot_token,
            chat_id,
            api_base: "https://api.telegram.org".to_string(),
            client,
        }
    }

    /// Point the channel at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }
}

impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn send(&self, notice: &FailureNotice, image: Option<&[u8]>) -> Result<()> {
        let caption = format!("🚨 *Print Sentinel: Print Failure*\n\n{}", notice.describe().replace("**", "*"));

        let response = match image {
            Some(image_data) => {
                let form = multipart::Form::new()
                    .text("chat_id", self.chat_id.clone())
                    .text("caption", caption)
                    .text("parse_mode", "Markdown")
                    .part(
                        "photo",
                        multipart::Part::bytes(image_data.to_vec())
                            .file_name("snapshot.jpg")
                            .mime_str("image/jpeg")?,
                    );
                self.client.post(self.method_url("sendPhoto")).multipart(form).send()?
            }
            None => self
                .client
                .post(self.method_url("sendMessage"))
                .json(&json!({
                    "chat_id": self.chat_id,
                    "text": caption,
                    "parse_mode": "Markdown",
                }))
                .send()?,
        };

        if !response.status().is_success() {
            warn!("Telegram rejected notification: HTTP {}", response.status());
            return Err(anyhow::anyhow!(
                "Failed to send Telegram alert: HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }
}
