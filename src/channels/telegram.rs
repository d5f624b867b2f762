//! Telegram side of the relay — long-polls the Bot API for updates.
//!
//! Native Bot API over HTTP: `getUpdates` long-polling for intake,
//! `sendMessage`/`sendPhoto`/`sendVideo`/`sendDocument` for delivery,
//! `getFile` for lazy attachment downloads.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::split_message;
use crate::error::{ChannelError, IdentityError, SendError};
use crate::relay::attachment::AttachmentKind;
use crate::relay::types::{
    AttachmentPayload, AttachmentRef, AttachmentSource, BotIdentity, ChatPlatform, EventStream,
    InboundEvent, OutboundContext, Platform,
};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram channel — connects to the Bot API via long-polling, bound to
/// one chat.
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, chat_id: String) -> Self {
        Self {
            bot_token: bot_token.expose_secret().to_string(),
            chat_id,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    /// Send a text unit. Telegram has no per-message identity override, so
    /// the display name is rendered as a prefix. Splits long messages that
    /// exceed Telegram's 4096 char limit.
    async fn send_text(&self, display_name: &str, text: &str) -> Result<(), SendError> {
        let rendered = format!("{display_name}: {text}");
        for chunk in split_message(&rendered, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(&chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars). Relayed user text goes
    /// out without parse_mode — it must never be reinterpreted as markup.
    async fn send_message_chunk(&self, text: &str) -> Result<(), SendError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Network {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        check_send_response(resp).await
    }

    /// Send one attachment on the delivery path its kind calls for.
    async fn send_media(
        &self,
        display_name: &str,
        payload: &AttachmentPayload,
    ) -> Result<(), SendError> {
        let (method, field) = match payload.kind {
            AttachmentKind::Image => ("sendPhoto", "photo"),
            AttachmentKind::Video => ("sendVideo", "video"),
            AttachmentKind::File => ("sendDocument", "document"),
        };

        let part = Part::bytes(payload.bytes.clone()).file_name(payload.filename.clone());
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", format!("{display_name}:"))
            .part(field, part);

        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SendError::Network {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        check_send_response(resp).await?;
        tracing::info!(
            filename = %payload.filename,
            kind = payload.kind.as_str(),
            "Telegram media sent"
        );
        Ok(())
    }
}

// ── ChatPlatform implementation ─────────────────────────────────────

#[async_trait]
impl ChatPlatform for TelegramChannel {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn self_identity(&self) -> Result<BotIdentity, ChannelError> {
        let startup_failed = |reason: String| ChannelError::StartupFailed {
            name: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(startup_failed(format!("getMe returned {}", resp.status())));
        }

        let me: GetMeResponse = resp
            .json()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        Ok(BotIdentity {
            user_id: me.result.id.to_string(),
            proxy_tag: None,
        })
    }

    async fn subscribe(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot_token = self.bot_token.clone();
        let chat_id = self.chat_id.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let files = TelegramFiles {
                client: client.clone(),
                bot_token: bot_token.clone(),
            };
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let url = format!("https://api.telegram.org/bot{bot_token}/getUpdates");
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Some(results) = data.get("result").and_then(serde_json::Value::as_array) {
                    for update in results {
                        // Advance offset past this update
                        if let Some(uid) =
                            update.get("update_id").and_then(serde_json::Value::as_i64)
                        {
                            offset = uid + 1;
                        }

                        let Some(message) = update.get("message") else {
                            continue;
                        };

                        let Some(event) = event_from_message(message, &chat_id, &files) else {
                            continue;
                        };

                        if tx.send(event).is_err() {
                            tracing::info!("Telegram listener channel closed");
                            return;
                        }
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
            self.send_text(&outbound.display_name, text).await?;
        }
        if let Some(payload) = &outbound.attachment {
            self.send_media(&outbound.display_name, payload).await?;
        }
        Ok(())
    }

    async fn avatar_url(&self, sender_id: &str) -> Result<Option<String>, IdentityError> {
        let degraded = |reason: String| IdentityError::AvatarLookup {
            platform: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .get(self.api_url("getUserProfilePhotos"))
            .query(&[("user_id", sender_id), ("limit", "1")])
            .send()
            .await
            .map_err(|e| degraded(e.to_string()))?;

        let data: serde_json::Value = resp.json().await.map_err(|e| degraded(e.to_string()))?;

        let Some(file_id) = data
            .pointer("/result/photos/0")
            .and_then(serde_json::Value::as_array)
            .and_then(|sizes| sizes.last())
            .and_then(|size| size.get("file_id"))
            .and_then(serde_json::Value::as_str)
        else {
            return Ok(None);
        };

        // The returned URL embeds the bot token; the peer platform fetches
        // it server-side.
        let url = resolve_file_url(&self.client, &self.bot_token, file_id)
            .await
            .map_err(|e| degraded(e.to_string()))?;
        Ok(Some(url))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Event mapping ───────────────────────────────────────────────────

/// File-download context handed to lazily-fetched attachment sources.
#[derive(Clone)]
struct TelegramFiles {
    client: reqwest::Client,
    bot_token: String,
}

impl TelegramFiles {
    fn source(&self, file_id: &str, filename: &str) -> Arc<dyn AttachmentSource> {
        Arc::new(TelegramFileSource {
            client: self.client.clone(),
            bot_token: self.bot_token.clone(),
            file_id: file_id.to_string(),
            filename: filename.to_string(),
        })
    }
}

/// Map one getUpdates message object into a relay event.
///
/// Returns None for messages outside the bound chat and for service
/// messages with nothing to relay.
fn event_from_message(
    message: &serde_json::Value,
    bound_chat_id: &str,
    files: &TelegramFiles,
) -> Option<InboundEvent> {
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    if chat_id.to_string() != bound_chat_id {
        return None;
    }

    let from = message.get("from")?;
    let sender_id = from.get("id")?.as_i64()?.to_string();
    let message_id = message.get("message_id")?.as_i64()?;

    let mut event = InboundEvent::new(Platform::Telegram, sender_id)
        .with_event_id(message_id.to_string())
        .automated(from.get("is_bot").and_then(serde_json::Value::as_bool).unwrap_or(false));

    if let Some(name) = display_name(from) {
        event = event.with_sender_name(name);
    }

    if let Some(secs) = message.get("date").and_then(serde_json::Value::as_i64) {
        if let Some(sent_at) = DateTime::from_timestamp(secs, 0) {
            event.received_at = sent_at;
        }
    }

    if let Some(text) = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(serde_json::Value::as_str)
    {
        event = event.with_text(text);
    }

    // Photos arrive as a size ladder; the last entry is the largest.
    if let Some(file_id) = message
        .get("photo")
        .and_then(serde_json::Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|size| size.get("file_id"))
        .and_then(serde_json::Value::as_str)
    {
        event = event.with_attachment(AttachmentRef {
            filename: "photo.jpg".into(),
            content_type: Some("image/jpeg".into()),
            source: files.source(file_id, "photo.jpg"),
        });
    }

    if let Some(video) = message.get("video") {
        if let Some(file_id) = video.get("file_id").and_then(serde_json::Value::as_str) {
            let filename = video
                .get("file_name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("video.mp4");
            event = event.with_attachment(AttachmentRef {
                filename: filename.into(),
                content_type: video
                    .get("mime_type")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
                source: files.source(file_id, filename),
            });
        }
    }

    if let Some(document) = message.get("document") {
        if let Some(file_id) = document.get("file_id").and_then(serde_json::Value::as_str) {
            let filename = document
                .get("file_name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("file.bin");
            event = event.with_attachment(AttachmentRef {
                filename: filename.into(),
                content_type: document
                    .get("mime_type")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
                source: files.source(file_id, filename),
            });
        }
    }

    if event.text.is_none() && event.attachments.is_empty() {
        return None;
    }
    Some(event)
}

/// Full name when present, else the account handle.
fn display_name(from: &serde_json::Value) -> Option<String> {
    let first = from.get("first_name").and_then(serde_json::Value::as_str);
    let last = from.get("last_name").and_then(serde_json::Value::as_str);
    let username = from.get("username").and_then(serde_json::Value::as_str);

    match (first, last) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(first), None) => Some(first.to_string()),
        _ => username.map(String::from),
    }
}

// ── File downloads ──────────────────────────────────────────────────

/// Lazy byte source for a Telegram file id.
struct TelegramFileSource {
    client: reqwest::Client,
    bot_token: String,
    file_id: String,
    filename: String,
}

#[async_trait]
impl AttachmentSource for TelegramFileSource {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError> {
        let fetch_failed = |reason: String| ChannelError::AttachmentFetch {
            filename: self.filename.clone(),
            reason,
        };

        let url = resolve_file_url(&self.client, &self.bot_token, &self.file_id)
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;

        let resp = self
            .client
            .get(&url)
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

#[derive(Deserialize)]
struct GetMeResponse {
    result: TelegramUser,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Deserialize)]
struct GetFileResponse {
    result: TelegramFile,
}

#[derive(Deserialize)]
struct TelegramFile {
    file_path: String,
}

/// Resolve a file id to a downloadable URL via getFile.
async fn resolve_file_url(
    client: &reqwest::Client,
    bot_token: &str,
    file_id: &str,
) -> Result<String, ChannelError> {
    let url = format!("https://api.telegram.org/bot{bot_token}/getFile");
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "file_id": file_id }))
        .send()
        .await
        .map_err(|e| ChannelError::Http(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ChannelError::Http(format!(
            "getFile returned {}",
            resp.status()
        )));
    }

    let file: GetFileResponse = resp
        .json()
        .await
        .map_err(|e| ChannelError::Http(e.to_string()))?;

    Ok(format!(
        "https://api.telegram.org/file/bot{bot_token}/{}",
        file.result.file_path
    ))
}

// ── Send response classification ────────────────────────────────────

/// Classify a Bot API response for the retry policy.
async fn check_send_response(resp: reqwest::Response) -> Result<(), SendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }

    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(SendError::RateLimited {
            name: "telegram".into(),
            retry_after: retry_after_from_body(&body),
        });
    }
    if status.is_client_error() {
        return Err(SendError::Rejected {
            name: "telegram".into(),
            reason: format!("{status}: {body}"),
        });
    }
    Err(SendError::Network {
        name: "telegram".into(),
        reason: format!("{status}: {body}"),
    })
}

/// Extract `parameters.retry_after` (seconds) from a 429 response body.
fn retry_after_from_body(body: &str) -> Option<std::time::Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/parameters/retry_after")?
        .as_u64()
        .map(std::time::Duration::from_secs)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> TelegramFiles {
        TelegramFiles {
            client: reqwest::Client::new(),
            bot_token: "fake-token".into(),
        }
    }

    fn text_message() -> serde_json::Value {
        serde_json::json!({
            "message_id": 42,
            "date": 1700000000,
            "chat": { "id": 555 },
            "from": {
                "id": 7,
                "is_bot": false,
                "first_name": "Alice",
                "username": "alice_handle"
            },
            "text": "hello"
        })
    }

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new("fake-token".into(), "555".into());
        assert_eq!(ch.platform(), Platform::Telegram);
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new("123:ABC".into(), "555".into());
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    // ── Event mapping tests ─────────────────────────────────────────

    #[test]
    fn maps_text_message() {
        let event = event_from_message(&text_message(), "555", &files()).unwrap();
        assert_eq!(event.platform, Platform::Telegram);
        assert_eq!(event.event_id.as_deref(), Some("42"));
        assert_eq!(event.sender_id, "7");
        assert_eq!(event.sender_name.as_deref(), Some("Alice"));
        assert_eq!(event.text.as_deref(), Some("hello"));
        assert!(event.attachments.is_empty());
        assert!(!event.sender_is_automated);
        assert_eq!(event.received_at.timestamp(), 1700000000);
    }

    #[test]
    fn drops_message_from_other_chat() {
        assert!(event_from_message(&text_message(), "999", &files()).is_none());
    }

    #[test]
    fn maps_bot_flag() {
        let mut message = text_message();
        message["from"]["is_bot"] = serde_json::json!(true);
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert!(event.sender_is_automated);
    }

    #[test]
    fn full_name_preferred_over_username() {
        let mut message = text_message();
        message["from"]["last_name"] = serde_json::json!("Liddell");
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert_eq!(event.sender_name.as_deref(), Some("Alice Liddell"));
    }

    #[test]
    fn username_used_when_no_first_name() {
        let mut message = text_message();
        message["from"].as_object_mut().unwrap().remove("first_name");
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert_eq!(event.sender_name.as_deref(), Some("alice_handle"));
    }

    #[test]
    fn photo_picks_largest_size() {
        let mut message = text_message();
        message.as_object_mut().unwrap().remove("text");
        message["caption"] = serde_json::json!("look");
        message["photo"] = serde_json::json!([
            { "file_id": "small", "width": 90 },
            { "file_id": "large", "width": 800 }
        ]);
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert_eq!(event.text.as_deref(), Some("look"));
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].filename, "photo.jpg");
        assert_eq!(
            event.attachments[0].content_type.as_deref(),
            Some("image/jpeg")
        );
    }

    #[test]
    fn document_keeps_native_filename() {
        let mut message = text_message();
        message.as_object_mut().unwrap().remove("text");
        message["document"] = serde_json::json!({
            "file_id": "doc-1",
            "file_name": "report.pdf",
            "mime_type": "application/pdf"
        });
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert_eq!(event.attachments[0].filename, "report.pdf");
        assert_eq!(
            event.attachments[0].content_type.as_deref(),
            Some("application/pdf")
        );
    }

    #[test]
    fn video_defaults_filename() {
        let mut message = text_message();
        message.as_object_mut().unwrap().remove("text");
        message["video"] = serde_json::json!({ "file_id": "vid-1", "mime_type": "video/mp4" });
        let event = event_from_message(&message, "555", &files()).unwrap();
        assert_eq!(event.attachments[0].filename, "video.mp4");
    }

    #[test]
    fn service_message_with_nothing_to_relay_is_dropped() {
        let mut message = text_message();
        message.as_object_mut().unwrap().remove("text");
        assert!(event_from_message(&message, "555", &files()).is_none());
    }

    #[test]
    fn message_without_sender_is_dropped() {
        let mut message = text_message();
        message.as_object_mut().unwrap().remove("from");
        assert!(event_from_message(&message, "555", &files()).is_none());
    }

    // ── Retry-after parsing ─────────────────────────────────────────

    #[test]
    fn retry_after_parsed_from_429_body() {
        let body = r#"{"ok":false,"error_code":429,"parameters":{"retry_after":12}}"#;
        assert_eq!(
            retry_after_from_body(body),
            Some(std::time::Duration::from_secs(12))
        );
    }

    #[test]
    fn retry_after_absent_or_garbage() {
        assert_eq!(retry_after_from_body(r#"{"ok":false}"#), None);
        assert_eq!(retry_after_from_body("not json"), None);
    }

    // ── Network error tests (no server reachable) ───────────────────

    #[tokio::test]
    async fn send_chunk_fails_without_valid_server() {
        let ch = TelegramChannel::new("fake-token".into(), "555".into());
        let result = ch.send_message_chunk("hello").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn file_source_fetch_fails_without_server() {
        let source = files().source("file-1", "cat.png");
        let result = source.fetch().await;
        assert!(result.is_err());
    }
}
