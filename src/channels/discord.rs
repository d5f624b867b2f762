//! Discord side of the relay — polls the bound channel via REST, delivers
//! through a webhook.
//!
//! Outbound goes through webhook execution because only webhooks accept
//! per-message `username`/`avatar_url` overrides — that is what preserves
//! sender identity on the Discord side. Messages posted this way come back
//! from the API carrying the webhook id, which the loop guard matches as
//! the relay's own proxy tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::split_message;
use crate::error::{ChannelError, SendError};
use crate::relay::types::{
    AttachmentPayload, AttachmentRef, AttachmentSource, BotIdentity, ChatPlatform, EventStream,
    InboundEvent, OutboundContext, Platform,
};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Maximum content length for Discord messages.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

/// Delay between message polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Discord channel — REST polling for intake, webhook execution for
/// delivery, bound to one channel.
pub struct DiscordChannel {
    bot_token: String,
    channel_id: String,
    webhook_url: String,
    webhook_id: Option<String>,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(bot_token: SecretString, channel_id: String, webhook_url: SecretString) -> Self {
        let webhook_url = webhook_url.expose_secret().to_string();
        let webhook_id = webhook_id_from_url(&webhook_url);
        Self {
            bot_token: bot_token.expose_secret().to_string(),
            channel_id,
            webhook_url,
            webhook_id,
            client: reqwest::Client::new(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    fn messages_url(&self) -> String {
        format!("{DISCORD_API_BASE}/channels/{}/messages", self.channel_id)
    }

    /// Execute the webhook with a JSON payload (text units).
    async fn execute_webhook(&self, payload: serde_json::Value) -> Result<(), SendError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .query(&[("wait", "true")])
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Network {
                name: "discord".into(),
                reason: e.to_string(),
            })?;

        check_send_response(resp).await
    }

    async fn send_text(&self, outbound: &OutboundContext, text: &str) -> Result<(), SendError> {
        for chunk in split_message(text, DISCORD_MAX_MESSAGE_LENGTH) {
            let payload =
                webhook_payload(&outbound.display_name, outbound.avatar.as_deref(), Some(&chunk));
            self.execute_webhook(payload).await?;
        }
        Ok(())
    }

    /// Upload one attachment through the webhook. Discord renders images
    /// and videos inline on its own; one upload path covers every kind.
    async fn send_media(
        &self,
        outbound: &OutboundContext,
        payload: &AttachmentPayload,
    ) -> Result<(), SendError> {
        let meta = webhook_payload(&outbound.display_name, outbound.avatar.as_deref(), None);
        let form = Form::new()
            .text("payload_json", meta.to_string())
            .part(
                "files[0]",
                Part::bytes(payload.bytes.clone()).file_name(payload.filename.clone()),
            );

        let resp = self
            .client
            .post(&self.webhook_url)
            .query(&[("wait", "true")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| SendError::Network {
                name: "discord".into(),
                reason: e.to_string(),
            })?;

        check_send_response(resp).await?;
        tracing::info!(
            filename = %payload.filename,
            kind = payload.kind.as_str(),
            "Discord media sent"
        );
        Ok(())
    }
}

// ── ChatPlatform implementation ─────────────────────────────────────

#[async_trait]
impl ChatPlatform for DiscordChannel {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn self_identity(&self) -> Result<BotIdentity, ChannelError> {
        let startup_failed = |reason: String| ChannelError::StartupFailed {
            name: "discord".into(),
            reason,
        };

        let resp = self
            .client
            .get(format!("{DISCORD_API_BASE}/users/@me"))
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(startup_failed(format!(
                "users/@me returned {}",
                resp.status()
            )));
        }

        let user: DiscordUser = resp
            .json()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        Ok(BotIdentity {
            user_id: user.id,
            proxy_tag: self.webhook_id.clone(),
        })
    }

    async fn subscribe(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = self.client.clone();
        let auth = self.auth_header();
        let messages_url = self.messages_url();

        tokio::spawn(async move {
            // Seed the cursor from the newest message so history is not
            // replayed on startup.
            let mut cursor = latest_message_id(&client, &auth, &messages_url).await;

            tracing::info!("Discord channel polling for messages...");

            loop {
                tokio::time::sleep(POLL_INTERVAL).await;

                let mut request = client
                    .get(&messages_url)
                    .header(AUTHORIZATION, &auth)
                    .query(&[("limit", "100")]);
                if let Some(after) = cursor.as_deref() {
                    request = request.query(&[("after", after)]);
                }

                let resp = match request.send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Discord poll error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                if !resp.status().is_success() {
                    tracing::warn!(status = %resp.status(), "Discord poll rejected");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }

                let mut batch: Vec<serde_json::Value> = match resp.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!("Discord parse error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                // The API returns newest first; relay oldest first.
                batch.sort_by_key(|message| {
                    snowflake(message.get("id").and_then(serde_json::Value::as_str).unwrap_or(""))
                });

                for message in &batch {
                    if let Some(id) = message.get("id").and_then(serde_json::Value::as_str) {
                        cursor = Some(id.to_string());
                    }

                    let Some(event) = event_from_message(message, &client) else {
                        continue;
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Discord listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, outbound: &OutboundContext) -> Result<(), SendError> {
        if let Some(text) = outbound.text.as_deref() {
            self.send_text(outbound, text).await?;
        }
        if let Some(payload) = &outbound.attachment {
            self.send_media(outbound, payload).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Discord channel shutting down");
        Ok(())
    }
}

// ── Event mapping ───────────────────────────────────────────────────

/// Map one channel message object into a relay event.
///
/// Returns None for messages with nothing to relay (embeds-only, system
/// messages).
fn event_from_message(
    message: &serde_json::Value,
    client: &reqwest::Client,
) -> Option<InboundEvent> {
    let id = message.get("id")?.as_str()?;
    let author = message.get("author")?;
    let sender_id = author.get("id")?.as_str()?;

    let mut event = InboundEvent::new(Platform::Discord, sender_id)
        .with_event_id(id)
        .automated(author.get("bot").and_then(serde_json::Value::as_bool).unwrap_or(false));

    if let Some(tag) = message.get("webhook_id").and_then(serde_json::Value::as_str) {
        event = event.with_origin_tag(tag);
    }

    if let Some(name) = author
        .get("global_name")
        .and_then(serde_json::Value::as_str)
        .or_else(|| author.get("username").and_then(serde_json::Value::as_str))
    {
        event = event.with_sender_name(name);
    }

    if let Some(hash) = author.get("avatar").and_then(serde_json::Value::as_str) {
        event = event.with_avatar(cdn_avatar_url(sender_id, hash));
    }

    if let Some(stamp) = message.get("timestamp").and_then(serde_json::Value::as_str) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
            event.received_at = parsed.with_timezone(&Utc);
        }
    }

    if let Some(content) = message
        .get("content")
        .and_then(serde_json::Value::as_str)
        .filter(|content| !content.is_empty())
    {
        event = event.with_text(content);
    }

    if let Some(attachments) = message.get("attachments").and_then(serde_json::Value::as_array) {
        for attachment in attachments {
            let (Some(filename), Some(url)) = (
                attachment.get("filename").and_then(serde_json::Value::as_str),
                attachment.get("url").and_then(serde_json::Value::as_str),
            ) else {
                continue;
            };
            event = event.with_attachment(AttachmentRef {
                filename: filename.into(),
                content_type: attachment
                    .get("content_type")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
                source: Arc::new(UrlSource {
                    client: client.clone(),
                    url: url.into(),
                    filename: filename.into(),
                }),
            });
        }
    }

    if event.text.is_none() && event.attachments.is_empty() {
        return None;
    }
    Some(event)
}

fn cdn_avatar_url(user_id: &str, avatar_hash: &str) -> String {
    format!("https://cdn.discordapp.com/avatars/{user_id}/{avatar_hash}.png")
}

/// Numeric snowflake value for chronological ordering of poll batches.
fn snowflake(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

/// Extract the webhook id from a webhook URL
/// (`https://discord.com/api/webhooks/{id}/{token}`).
fn webhook_id_from_url(url: &str) -> Option<String> {
    let rest = &url[url.find("/webhooks/")? + "/webhooks/".len()..];
    let id = rest.split('/').next()?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
}

/// Webhook payload with identity overrides. Relayed content must never
/// ping roles or @everyone on the target side.
fn webhook_payload(
    display_name: &str,
    avatar: Option<&str>,
    text: Option<&str>,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "username": display_name,
        "allowed_mentions": { "parse": [] }
    });
    if let Some(url) = avatar {
        payload["avatar_url"] = serde_json::Value::String(url.to_string());
    }
    if let Some(content) = text {
        payload["content"] = serde_json::Value::String(content.to_string());
    }
    payload
}

async fn latest_message_id(
    client: &reqwest::Client,
    auth: &str,
    messages_url: &str,
) -> Option<String> {
    let resp = client
        .get(messages_url)
        .header(AUTHORIZATION, auth)
        .query(&[("limit", "1")])
        .send()
        .await
        .ok()?;
    let batch: Vec<serde_json::Value> = resp.json().await.ok()?;
    batch.first()?.get("id")?.as_str().map(String::from)
}

#[derive(Deserialize)]
struct DiscordUser {
    id: String,
}

// ── Attachment downloads ────────────────────────────────────────────

/// Lazy byte source for a CDN attachment URL.
struct UrlSource {
    client: reqwest::Client,
    url: String,
    filename: String,
}

#[async_trait]
impl AttachmentSource for UrlSource {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError> {
        let fetch_failed = |reason: String| ChannelError::AttachmentFetch {
            filename: self.filename.clone(),
            reason,
        };

        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(fetch_failed(format!("download returned {}", resp.status())));
        }

        let bytes = resp.bytes().await.map_err(|e| fetch_failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ── Send response classification ────────────────────────────────────

/// Classify a webhook response for the retry policy.
async fn check_send_response(resp: reqwest::Response) -> Result<(), SendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }

    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(SendError::RateLimited {
            name: "discord".into(),
            retry_after: retry_after_from_body(&body),
        });
    }
    if status.is_client_error() {
        return Err(SendError::Rejected {
            name: "discord".into(),
            reason: format!("{status}: {body}"),
        });
    }
    Err(SendError::Network {
        name: "discord".into(),
        reason: format!("{status}: {body}"),
    })
}

/// Extract `retry_after` (fractional seconds) from a 429 response body.
fn retry_after_from_body(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after")?
        .as_f64()
        .map(Duration::from_secs_f64)
}

// ── Tests ───────────────────────────────────────────────────────────
