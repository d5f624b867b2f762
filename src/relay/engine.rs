//! Relay engine — consumes both platform subscriptions and forwards
//! events to the opposite side.
//!
//! Per event: loop guard → dedup ledger → identity resolution → per-unit
//! translation (text first, then each attachment) → send with bounded
//! retry. The two directions run as independent pump tasks; a slow send on
//! one side never stalls intake on the other. The dedup ledger is the only
//! state shared between them.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ChannelError, Error, SendError};
use crate::relay::attachment::classify;
use crate::relay::dedup::{DedupLedger, RelayKey};
use crate::relay::guard::LoopGuard;
use crate::relay::identity::{self, OutboundIdentity};
use crate::relay::types::{
    AttachmentPayload, AttachmentRef, ChatPlatform, EventStream, InboundEvent, OutboundContext,
    Platform,
};

/// Maximum extra jitter added to each backoff delay.
const RETRY_JITTER_MS: u64 = 250;

/// Terminal state of one relay operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Loop guard match — the event came from the relay's own output.
    Filtered,
    /// Duplicate delivery of an already-relayed message.
    Deduped,
    /// Translated and sent; counts successful and dropped units.
    Relayed { sent: usize, dropped: usize },
}

/// The relay orchestrator. Owns the loop guard, the dedup ledger, and the
/// retry policy; shared between the two direction pumps via `Arc`.
pub struct RelayEngine {
    discord: Arc<dyn ChatPlatform>,
    telegram: Arc<dyn ChatPlatform>,
    guard: LoopGuard,
    ledger: DedupLedger,
    config: EngineConfig,
}

impl RelayEngine {
    /// Build the engine, querying each platform for the relay's own
    /// identity to seed the loop guard.
    pub async fn connect(
        discord: Arc<dyn ChatPlatform>,
        telegram: Arc<dyn ChatPlatform>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        let mut guard = LoopGuard::new(config.suppress_automated);
        for side in [&discord, &telegram] {
            let identity = side.self_identity().await?;
            info!(
                platform = %side.platform(),
                user_id = %identity.user_id,
                "Resolved relay identity"
            );
            guard.register(side.platform(), identity);
        }

        let ledger = DedupLedger::new(config.ledger_capacity);
        Ok(Self {
            discord,
            telegram,
            guard,
            ledger,
            config,
        })
    }

    fn side(&self, platform: Platform) -> &Arc<dyn ChatPlatform> {
        match platform {
            Platform::Discord => &self.discord,
            Platform::Telegram => &self.telegram,
        }
    }

    // ── Main loop ───────────────────────────────────────────────────

    /// Subscribe to both platforms and pump events until Ctrl-C or both
    /// streams end. In-flight operations get a grace period on shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let discord_stream = self.discord.subscribe().await?;
        let telegram_stream = self.telegram.subscribe().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut discord_pump: JoinHandle<()> = tokio::spawn(self.clone().pump(
            Platform::Discord,
            discord_stream,
            shutdown_rx.clone(),
        ));
        let mut telegram_pump: JoinHandle<()> = tokio::spawn(self.clone().pump(
            Platform::Telegram,
            telegram_stream,
            shutdown_rx,
        ));

        info!("Relay ready, bridging discord <-> telegram");

        let mut pumps_done = false;
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
            _ = async {
                let _ = (&mut discord_pump).await;
                let _ = (&mut telegram_pump).await;
            } => {
                pumps_done = true;
                info!("Both event streams ended, shutting down...");
            }
        }

        let _ = shutdown_tx.send(true);
        if !pumps_done {
            let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                // A handle may already have been joined by the select arm;
                // re-polling a consumed JoinHandle panics.
                if !discord_pump.is_finished() {
                    let _ = (&mut discord_pump).await;
                }
                if !telegram_pump.is_finished() {
                    let _ = (&mut telegram_pump).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    grace = ?self.config.shutdown_grace,
                    "Pumps did not stop within the grace period, aborting"
                );
                discord_pump.abort();
                telegram_pump.abort();
            }
        }

        if let Err(e) = self.discord.shutdown().await {
            warn!(error = %e, "Discord shutdown reported an error");
        }
        if let Err(e) = self.telegram.shutdown().await {
            warn!(error = %e, "Telegram shutdown reported an error");
        }

        Ok(())
    }

    /// Consume one platform's event stream serially. Serial processing per
    /// direction preserves cross-message send order from that source.
    async fn pump(
        self: Arc<Self>,
        source: Platform,
        mut stream: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(platform = %source, "Pump stopping");
                    break;
                }
                next = stream.next() => match next {
                    Some(event) => event,
                    None => {
                        warn!(platform = %source, "Event stream ended");
                        break;
                    }
                },
            };

            self.relay_event(event).await;
        }
    }

    // ── One relay operation ─────────────────────────────────────────

    /// Relay a single inbound event to the opposite platform.
    pub async fn relay_event(&self, event: InboundEvent) -> RelayOutcome {
        if self.guard.is_self_originated(&event) {
            debug!(
                platform = %event.platform,
                sender = %event.sender_id,
                "Suppressing self-originated event"
            );
            return RelayOutcome::Filtered;
        }

        let key = RelayKey::for_event(&event);
        if !self.ledger.check_and_record(event.platform, key) {
            debug!(
                platform = %event.platform,
                id = event.event_id.as_deref().unwrap_or("-"),
                "Suppressing duplicate delivery"
            );
            return RelayOutcome::Deduped;
        }

        info!(
            platform = %event.platform,
            id = event.event_id.as_deref().unwrap_or("-"),
            sender = %event.sender_id,
            attachments = event.attachments.len(),
            "Relaying event"
        );

        let identity = self.resolve_identity(&event).await;
        let target = self.side(event.platform.peer());

        let mut sent = 0usize;
        let mut dropped = 0usize;

        // Text precedes attachments, in source order.
        if let Some(text) = event.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let outbound = OutboundContext {
                display_name: identity.name.clone(),
                avatar: identity.avatar.clone(),
                text: Some(text.to_string()),
                attachment: None,
            };
            if self.send_with_retry(target, &outbound).await {
                sent += 1;
            } else {
                dropped += 1;
            }
        }

        for attachment in &event.attachments {
            let outbound = match self.fetch_attachment(attachment).await {
                Ok(bytes) => OutboundContext {
                    display_name: identity.name.clone(),
                    avatar: identity.avatar.clone(),
                    text: None,
                    attachment: Some(AttachmentPayload {
                        kind: classify(&attachment.filename, attachment.content_type.as_deref()),
                        filename: attachment.filename.clone(),
                        bytes,
                    }),
                },
                Err(e) => {
                    warn!(
                        filename = %attachment.filename,
                        error = %e,
                        "Attachment fetch failed, relaying a notice instead"
                    );
                    OutboundContext {
                        display_name: identity.name.clone(),
                        avatar: identity.avatar.clone(),
                        text: Some(format!("[attachment unavailable: {}]", attachment.filename)),
                        attachment: None,
                    }
                }
            };
            if self.send_with_retry(target, &outbound).await {
                sent += 1;
            } else {
                dropped += 1;
            }
        }

        RelayOutcome::Relayed { sent, dropped }
    }

    // ── Identity ────────────────────────────────────────────────────

    /// Resolve the outbound identity, with a lazy avatar lookup on the
    /// source platform when the event carried none. Lookup failures
    /// degrade silently to no avatar.
    async fn resolve_identity(&self, event: &InboundEvent) -> OutboundIdentity {
        let mut identity = identity::resolve(event);
        if identity.avatar.is_none() {
            let lookup = self.side(event.platform).avatar_url(&event.sender_id);
            match tokio::time::timeout(self.config.send_timeout, lookup).await {
                Ok(Ok(avatar)) => identity.avatar = avatar,
                Ok(Err(e)) => {
                    debug!(
                        platform = %event.platform,
                        sender = %event.sender_id,
                        error = %e,
                        "Avatar lookup degraded to none"
                    );
                }
                Err(_) => {
                    debug!(
                        platform = %event.platform,
                        sender = %event.sender_id,
                        "Avatar lookup timed out, degrading to none"
                    );
                }
            }
        }
        identity
    }

    // ── Attachments ─────────────────────────────────────────────────

    /// Fetch one attachment's bytes, at most once, under the send timeout.
    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>, ChannelError> {
        match tokio::time::timeout(self.config.send_timeout, attachment.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::AttachmentFetch {
                filename: attachment.filename.clone(),
                reason: format!("timed out after {:?}", self.config.send_timeout),
            }),
        }
    }

    // ── Send with retry ─────────────────────────────────────────────

    /// Send one outbound unit with bounded retry on transient failures.
    /// Returns whether the unit was delivered.
    async fn send_with_retry(
        &self,
        target: &Arc<dyn ChatPlatform>,
        outbound: &OutboundContext,
    ) -> bool {
        let platform = target.platform();
        for attempt in 1..=self.config.max_send_attempts {
            let result = match tokio::time::timeout(self.config.send_timeout, target.send(outbound))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SendError::Network {
                    name: platform.as_str().into(),
                    reason: format!("send timed out after {:?}", self.config.send_timeout),
                }),
            };

            match result {
                Ok(()) => return true,
                Err(e) if e.is_transient() && attempt < self.config.max_send_attempts => {
                    let delay = self.backoff_delay(attempt, e.retry_after());
                    warn!(
                        platform = %platform,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        platform = %platform,
                        attempt,
                        error = %e,
                        "Send failed, dropping unit"
                    );
                    return false;
                }
            }
        }
        false
    }

    /// Exponential backoff with jitter; a server-provided retry-after wins.
    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after;
        }
        let exponential = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RETRY_JITTER_MS));
        exponential + jitter
    }
}

// ── Tests ───────────────────────────────────────────────────────────
