use std::sync::Arc;

use bridgebot::channels::{DiscordChannel, TelegramChannel};
use bridgebot::config::RelayConfig;
use bridgebot::relay::engine::RelayEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!(
                "  required: DISCORD_BOT_TOKEN, DISCORD_CHANNEL_ID, DISCORD_WEBHOOK_URL, \
                 TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID"
            );
            std::process::exit(1);
        }
    };

    eprintln!("🌉 Bridgebot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Discord channel: {}", config.discord.channel_id);
    eprintln!("   Telegram chat: {}", config.telegram.chat_id);
    eprintln!(
        "   Dedup ledger: {} keys per platform",
        config.engine.ledger_capacity
    );
    eprintln!(
        "   Bot traffic: {}\n",
        if config.engine.suppress_automated {
            "suppressed"
        } else {
            "relayed"
        }
    );

    let discord = Arc::new(DiscordChannel::new(
        config.discord.bot_token.clone(),
        config.discord.channel_id.clone(),
        config.discord.webhook_url.clone(),
    ));
    let telegram = Arc::new(TelegramChannel::new(
        config.telegram.bot_token.clone(),
        config.telegram.chat_id.clone(),
    ));

    let engine = Arc::new(RelayEngine::connect(discord, telegram, config.engine).await?);
    engine.run().await?;

    Ok(())
}
