//! Identity adapter — derives the outbound display identity for a sender.
//!
//! Resolution never fails: a missing or blank name falls back to a
//! per-platform placeholder, and avatar lookup degrades to none. Sender
//! identity must never block a relay.

use crate::relay::types::{InboundEvent, Platform};

/// Display identity handed to the target platform's send path.
#[derive(Debug, Clone)]
pub struct OutboundIdentity {
    pub name: String,
    pub avatar: Option<String>,
}

/// Resolve the display identity for an event's sender.
///
/// Uses the avatar reference carried on the event when present; lazy
/// platform lookups (Telegram profile photos) are the engine's job.
pub fn resolve(event: &InboundEvent) -> OutboundIdentity {
    let name = event
        .sender_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .unwrap_or_else(|| fallback_name(event.platform).to_string());

    OutboundIdentity {
        name,
        avatar: event.sender_avatar.clone(),
    }
}

fn fallback_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Discord => "discord-user",
        Platform::Telegram => "telegram-user",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_sender_name_when_present() {
        let event = InboundEvent::new(Platform::Telegram, "7").with_sender_name("alice");
        assert_eq!(resolve(&event).name, "alice");
    }

    #[test]
    fn falls_back_per_platform_when_name_missing() {
        let telegram = InboundEvent::new(Platform::Telegram, "7");
        assert_eq!(resolve(&telegram).name, "telegram-user");

        let discord = InboundEvent::new(Platform::Discord, "7");
        assert_eq!(resolve(&discord).name, "discord-user");
    }

    #[test]
    fn blank_name_falls_back() {
        let event = InboundEvent::new(Platform::Discord, "7").with_sender_name("   ");
        assert_eq!(resolve(&event).name, "discord-user");
    }

    #[test]
    fn name_is_trimmed() {
        let event = InboundEvent::new(Platform::Discord, "7").with_sender_name("  bob  ");
        assert_eq!(resolve(&event).name, "bob");
    }

    #[test]
    fn avatar_carried_through() {
        let event = InboundEvent::new(Platform::Discord, "7")
            .with_avatar("https://cdn.example/av.png");
        assert_eq!(
            resolve(&event).avatar.as_deref(),
            Some("https://cdn.example/av.png")
        );
    }

    #[test]
    fn no_avatar_resolves_to_none() {
        let event = InboundEvent::new(Platform::Telegram, "7").with_sender_name("alice");
        assert!(resolve(&event).avatar.is_none());
    }
}
