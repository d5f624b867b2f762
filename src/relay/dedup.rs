//! Dedup ledger — suppresses re-deliveries of already-relayed messages.
//!
//! Both direction pumps share one ledger; the check-and-record step is
//! atomic under a single lock so two near-simultaneous duplicates can never
//! both pass. State is in-memory only — suppression is best-effort within
//! one process lifetime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use crate::relay::types::{InboundEvent, Platform};

/// Dedup fingerprint for one logical source message.
///
/// `MessageId` is the platform's own stable identifier — stable across
/// redelivery, distinct across messages. `ContentDigest` is the fallback
/// when no identifier is available: a digest of (sender, trimmed text,
/// one-minute timestamp bucket). The digest is explicitly weaker —
/// identical text from the same sender within one bucket collapses into
/// one key — so the identifier is preferred whenever the platform
/// provides one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelayKey {
    MessageId(String),
    ContentDigest(u64),
}

impl RelayKey {
    pub fn for_event(event: &InboundEvent) -> Self {
        if let Some(id) = event.event_id.as_deref().filter(|id| !id.is_empty()) {
            return Self::MessageId(id.to_string());
        }

        let mut hasher = DefaultHasher::new();
        event.sender_id.hash(&mut hasher);
        event.text.as_deref().map(str::trim).unwrap_or("").hash(&mut hasher);
        (event.received_at.timestamp() / 60).hash(&mut hasher);
        Self::ContentDigest(hasher.finish())
    }
}

#[derive(Default)]
struct Side {
    seen: HashSet<RelayKey>,
    order: VecDeque<RelayKey>,
}

/// Bounded set of previously-seen relay keys, scoped per source platform.
///
/// Eviction is FIFO at a fixed capacity per platform: once more than
/// `capacity` distinct keys have been recorded, the oldest is forgotten and
/// a genuinely repeated key beyond that window is relayed again.
pub struct DedupLedger {
    capacity: usize,
    sides: Mutex<HashMap<Platform, Side>>,
}

impl DedupLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sides: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically check whether `key` is new for `platform` and record it.
    ///
    /// Returns `true` when the key was not seen before (the caller should
    /// relay), `false` on a duplicate (the caller must suppress).
    pub fn check_and_record(&self, platform: Platform, key: RelayKey) -> bool {
        let mut sides = self.sides.lock().unwrap_or_else(PoisonError::into_inner);
        let side = sides.entry(platform).or_default();

        if side.seen.contains(&key) {
            return false;
        }

        side.seen.insert(key.clone());
        side.order.push_back(key);
        while side.order.len() > self.capacity {
            if let Some(evicted) = side.order.pop_front() {
                side.seen.remove(&evicted);
            }
        }
        true
    }

    /// Number of retained keys for a platform.
    pub fn len(&self, platform: Platform) -> usize {
        let sides = self.sides.lock().unwrap_or_else(PoisonError::into_inner);
        sides.get(&platform).map_or(0, |side| side.order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event_at(sender: &str, text: &str, secs: i64) -> InboundEvent {
        let mut event = InboundEvent::new(Platform::Telegram, sender).with_text(text);
        event.received_at = Utc.timestamp_opt(secs, 0).unwrap();
        event
    }

    #[test]
    fn prefers_platform_message_id() {
        let event = InboundEvent::new(Platform::Discord, "alice")
            .with_event_id("m1")
            .with_text("hello");
        assert_eq!(RelayKey::for_event(&event), RelayKey::MessageId("m1".into()));
    }

    #[test]
    fn empty_id_falls_back_to_digest() {
        let event = event_at("alice", "hello", 600).with_event_id("");
        assert!(matches!(
            RelayKey::for_event(&event),
            RelayKey::ContentDigest(_)
        ));
    }

    #[test]
    fn digest_stable_within_bucket() {
        let a = event_at("alice", "hello", 600);
        let b = event_at("alice", "  hello  ", 630);
        assert_eq!(RelayKey::for_event(&a), RelayKey::for_event(&b));
    }

    #[test]
    fn digest_distinct_across_senders_and_text() {
        let a = event_at("alice", "hello", 600);
        let b = event_at("bob", "hello", 600);
        let c = event_at("alice", "goodbye", 600);
        assert_ne!(RelayKey::for_event(&a), RelayKey::for_event(&b));
        assert_ne!(RelayKey::for_event(&a), RelayKey::for_event(&c));
    }

    #[test]
    fn digest_distinct_across_buckets() {
        let a = event_at("alice", "hello", 600);
        let b = event_at("alice", "hello", 700);
        assert_ne!(RelayKey::for_event(&a), RelayKey::for_event(&b));
    }

    #[test]
    fn first_sighting_records() {
        let ledger = DedupLedger::new(8);
        assert!(ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m1".into())));
        assert!(!ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m1".into())));
    }

    #[test]
    fn keys_scoped_per_platform() {
        let ledger = DedupLedger::new(8);
        assert!(ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m1".into())));
        assert!(ledger.check_and_record(Platform::Telegram, RelayKey::MessageId("m1".into())));
    }

    #[test]
    fn oldest_key_evicted_past_capacity() {
        let ledger = DedupLedger::new(3);
        for i in 0..4 {
            assert!(ledger.check_and_record(
                Platform::Discord,
                RelayKey::MessageId(format!("m{i}"))
            ));
        }
        assert_eq!(ledger.len(Platform::Discord), 3);
        // m0 was evicted — a repeat beyond the retention window relays again.
        assert!(ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m0".into())));
        // m3 is still retained.
        assert!(!ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m3".into())));
    }

    #[test]
    fn capacity_has_a_floor_of_one() {
        let ledger = DedupLedger::new(0);
        assert!(ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m1".into())));
        assert!(!ledger.check_and_record(Platform::Discord, RelayKey::MessageId("m1".into())));
    }
}
