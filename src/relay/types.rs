//! Shared types for the relay core.
//!
//! Channel bindings convert their native formats into these types. The
//! relay engine only ever sees `InboundEvent` and produces `OutboundContext`
//! — platform wire formats never cross this boundary.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::{ChannelError, IdentityError, SendError};
use crate::relay::attachment::AttachmentKind;

// ── Platform ────────────────────────────────────────────────────────

/// The two platforms bound by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Discord,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Telegram => "telegram",
        }
    }

    /// The platform on the other side of the relay.
    pub fn peer(&self) -> Platform {
        match self {
            Self::Discord => Self::Telegram,
            Self::Telegram => Self::Discord,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Inbound event ───────────────────────────────────────────────────

/// Unified inbound event from either platform.
///
/// Immutable once constructed; consumed by exactly one relay operation.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Platform the event arrived from.
    pub platform: Platform,
    /// Platform-native message id, when the platform provides a stable one.
    pub event_id: Option<String>,
    /// Sender identifier (Discord user id, Telegram user id).
    pub sender_id: String,
    /// Human-readable sender name, if available.
    pub sender_name: Option<String>,
    /// Avatar reference (URL), if cheaply available at intake.
    pub sender_avatar: Option<String>,
    /// Whether the sender is a bot/automated account.
    pub sender_is_automated: bool,
    /// Marker identifying the outbound proxy a message was posted through
    /// (Discord webhook id). Used by the loop guard.
    pub origin_tag: Option<String>,
    /// Message text, if any.
    pub text: Option<String>,
    /// Attachments in source order. Bytes are fetched lazily.
    pub attachments: Vec<AttachmentRef>,
    /// When the platform says the message was sent.
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(platform: Platform, sender_id: impl Into<String>) -> Self {
        Self {
            platform,
            event_id: None,
            sender_id: sender_id.into(),
            sender_name: None,
            sender_avatar: None,
            sender_is_automated: false,
            origin_tag: None,
            text: None,
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.sender_avatar = Some(avatar.into());
        self
    }

    pub fn with_origin_tag(mut self, tag: impl Into<String>) -> Self {
        self.origin_tag = Some(tag.into());
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn automated(mut self, flag: bool) -> Self {
        self.sender_is_automated = flag;
        self
    }
}

// ── Attachments ─────────────────────────────────────────────────────

/// Lazy byte source for one attachment.
///
/// Implementations hold whatever handle the platform needs (a CDN URL, a
/// Telegram file id) and download only when `fetch` is called — events
/// dropped by the loop guard or dedup ledger never cost a download.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError>;
}

/// One attachment on an inbound event.
#[derive(Clone)]
pub struct AttachmentRef {
    pub filename: String,
    pub content_type: Option<String>,
    pub source: Arc<dyn AttachmentSource>,
}

impl fmt::Debug for AttachmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentRef")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

// ── Outbound payload ────────────────────────────────────────────────

/// Platform-agnostic payload for one outbound send.
///
/// One context per unit: the text of a message is one unit, each attachment
/// is its own unit. Constructed fresh per relay operation, never shared.
#[derive(Debug, Clone)]
pub struct OutboundContext {
    pub display_name: String,
    pub avatar: Option<String>,
    pub text: Option<String>,
    pub attachment: Option<AttachmentPayload>,
}

/// Fetched attachment bytes plus delivery classification.
#[derive(Clone)]
pub struct AttachmentPayload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub kind: AttachmentKind,
}

impl fmt::Debug for AttachmentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentPayload")
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ── Relay identity ──────────────────────────────────────────────────

/// The relay's own identity on one platform, queried at startup to seed
/// the loop guard.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    /// The relay bot's own user id on the platform.
    pub user_id: String,
    /// Marker that outbound messages carry on re-ingest (Discord webhook id).
    pub proxy_tag: Option<String>,
}

// ── Platform boundary trait ─────────────────────────────────────────

/// Stream of inbound events from one platform subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Boundary contract implemented by each platform binding — pure I/O,
/// no relay logic.
///
/// Bindings own authentication, connection management, and wire formats.
/// Subscriptions are effectively infinite and restart internally after
/// transient disconnects; the stream only ends on unrecoverable failure.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn platform(&self) -> Platform;

    /// Identity of the relay on this platform, for loop-guard checks.
    async fn self_identity(&self) -> Result<BotIdentity, ChannelError>;

    /// Start consuming new messages. Events predating the subscription are
    /// not replayed.
    async fn subscribe(&self) -> Result<EventStream, ChannelError>;

    /// Deliver one outbound unit.
    async fn send(&self, outbound: &OutboundContext) -> Result<(), SendError>;

    /// Best-effort avatar URL for a sender. Called lazily, after an event
    /// has survived the loop guard and dedup ledger; errors degrade to
    /// "no avatar".
    async fn avatar_url(&self, _sender_id: &str) -> Result<Option<String>, IdentityError> {
        Ok(None)
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
