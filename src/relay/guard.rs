//! Loop guard — keeps the relay from re-ingesting its own output.
//!
//! Runs before the dedup ledger and before any attachment fetch, so traffic
//! the relay must never touch costs nothing. Pure over already-validated
//! event fields; cannot fail.

use std::collections::HashMap;

use crate::relay::types::{BotIdentity, InboundEvent, Platform};

/// Suppresses inbound events that originated from the relay itself.
///
/// An event is self-originated when its sender is the relay's own bot user
/// on that platform, or when it carries the proxy tag of the relay's
/// outbound path (Discord webhook id). Optionally, all automated senders
/// are suppressed to rule out bot-to-bot amplification loops.
pub struct LoopGuard {
    identities: HashMap<Platform, BotIdentity>,
    suppress_automated: bool,
}

impl LoopGuard {
    pub fn new(suppress_automated: bool) -> Self {
        Self {
            identities: HashMap::new(),
            suppress_automated,
        }
    }

    /// Register the relay's own identity on a platform.
    pub fn register(&mut self, platform: Platform, identity: BotIdentity) {
        self.identities.insert(platform, identity);
    }

    /// Whether this event came from the relay's own output and must be
    /// dropped before any further work.
    pub fn is_self_originated(&self, event: &InboundEvent) -> bool {
        if let Some(own) = self.identities.get(&event.platform) {
            if event.sender_id == own.user_id {
                return true;
            }
            if let (Some(tag), Some(own_tag)) =
                (event.origin_tag.as_deref(), own.proxy_tag.as_deref())
            {
                if tag == own_tag {
                    return true;
                }
            }
        }

        self.suppress_automated && event.sender_is_automated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_with_discord_identity(suppress_automated: bool) -> LoopGuard {
        let mut guard = LoopGuard::new(suppress_automated);
        guard.register(
            Platform::Discord,
            BotIdentity {
                user_id: "bot-1".into(),
                proxy_tag: Some("wh-99".into()),
            },
        );
        guard
    }

    #[test]
    fn own_sender_id_is_suppressed() {
        let guard = guard_with_discord_identity(false);
        let event = InboundEvent::new(Platform::Discord, "bot-1").with_text("hi");
        assert!(guard.is_self_originated(&event));
    }

    #[test]
    fn own_proxy_tag_is_suppressed() {
        let guard = guard_with_discord_identity(false);
        let event = InboundEvent::new(Platform::Discord, "someone")
            .with_origin_tag("wh-99");
        assert!(guard.is_self_originated(&event));
    }

    #[test]
    fn foreign_proxy_tag_passes() {
        let guard = guard_with_discord_identity(false);
        let event = InboundEvent::new(Platform::Discord, "someone")
            .with_origin_tag("wh-other");
        assert!(!guard.is_self_originated(&event));
    }

    #[test]
    fn organic_sender_passes() {
        let guard = guard_with_discord_identity(true);
        let event = InboundEvent::new(Platform::Discord, "alice").with_text("hello");
        assert!(!guard.is_self_originated(&event));
    }

    #[test]
    fn automated_sender_suppressed_when_enabled() {
        let guard = guard_with_discord_identity(true);
        let event = InboundEvent::new(Platform::Discord, "other-bot").automated(true);
        assert!(guard.is_self_originated(&event));
    }

    #[test]
    fn automated_sender_passes_when_disabled() {
        let guard = guard_with_discord_identity(false);
        let event = InboundEvent::new(Platform::Discord, "other-bot").automated(true);
        assert!(!guard.is_self_originated(&event));
    }

    #[test]
    fn identity_is_scoped_per_platform() {
        let guard = guard_with_discord_identity(false);
        // Same id on the other platform is a different account.
        let event = InboundEvent::new(Platform::Telegram, "bot-1");
        assert!(!guard.is_self_originated(&event));
    }

    #[test]
    fn automated_check_applies_without_registered_identity() {
        let guard = LoopGuard::new(true);
        let event = InboundEvent::new(Platform::Telegram, "x").automated(true);
        assert!(guard.is_self_originated(&event));
    }
}
