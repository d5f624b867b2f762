//! Configuration — resolved once from the environment at startup.
//!
//! Credentials are opaque to the relay core: tokens and channel ids are
//! read here, wrapped, and handed to the bindings at construction time.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_LEDGER_CAPACITY: usize = 1024;
const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Discord side: bot token for intake, webhook for outbound delivery.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    pub channel_id: String,
    pub webhook_url: SecretString,
}

/// Telegram side: bot token and the bound chat.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

/// Relay engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retained dedup keys per platform (FIFO eviction past this bound).
    pub ledger_capacity: usize,
    /// Total attempts per outbound unit, including the first.
    pub max_send_attempts: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// Timeout applied to every outbound network operation.
    pub send_timeout: Duration,
    /// Suppress messages from any automated account, not just the relay's own.
    pub suppress_automated: bool,
    /// How long in-flight relay operations get to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            suppress_automated: true,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub discord: DiscordConfig,
    pub telegram: TelegramConfig,
    pub engine: EngineConfig,
}

impl RelayConfig {
    /// Read configuration from the environment.
    ///
    /// Required: `DISCORD_BOT_TOKEN`, `DISCORD_CHANNEL_ID`,
    /// `DISCORD_WEBHOOK_URL`, `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`.
    /// Engine tunables are optional `RELAY_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let discord = DiscordConfig {
            bot_token: SecretString::from(require("DISCORD_BOT_TOKEN")?),
            channel_id: require("DISCORD_CHANNEL_ID")?,
            webhook_url: SecretString::from(require("DISCORD_WEBHOOK_URL")?),
        };

        let telegram = TelegramConfig {
            bot_token: SecretString::from(require("TELEGRAM_BOT_TOKEN")?),
            chat_id: require("TELEGRAM_CHAT_ID")?,
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            ledger_capacity: parse_env_or("RELAY_LEDGER_CAPACITY", defaults.ledger_capacity),
            max_send_attempts: parse_env_or("RELAY_MAX_SEND_ATTEMPTS", defaults.max_send_attempts)
                .max(1),
            retry_base_delay: Duration::from_millis(parse_env_or(
                "RELAY_RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            send_timeout: Duration::from_secs(parse_env_or(
                "RELAY_SEND_TIMEOUT_SECS",
                DEFAULT_SEND_TIMEOUT_SECS,
            )),
            suppress_automated: flag_env_or("RELAY_SKIP_BOTS", true),
            shutdown_grace: Duration::from_secs(parse_env_or(
                "RELAY_SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
        };

        Ok(Self {
            discord,
            telegram,
            engine,
        })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn flag_env_or(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_are_bounded() {
        let config = EngineConfig::default();
        assert_eq!(config.ledger_capacity, 1024);
        assert_eq!(config.max_send_attempts, 3);
        assert!(config.suppress_automated);
        assert_eq!(config.send_timeout, Duration::from_secs(30));
    }

    #[test]
    fn require_rejects_missing_var() {
        // SAFETY: the var name is unique to this test; nothing reads it concurrently.
        unsafe { std::env::remove_var("RELAY_TEST_REQUIRE_MISSING") };
        assert!(matches!(
            require("RELAY_TEST_REQUIRE_MISSING"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn require_rejects_blank_var() {
        // SAFETY: the var name is unique to this test; nothing reads it concurrently.
        unsafe { std::env::set_var("RELAY_TEST_REQUIRE_BLANK", "   ") };
        assert!(require("RELAY_TEST_REQUIRE_BLANK").is_err());
    }

    #[test]
    fn parse_env_or_falls_back_on_garbage() {
        // SAFETY: the var name is unique to this test; nothing reads it concurrently.
        unsafe { std::env::set_var("RELAY_TEST_PARSE_GARBAGE", "not-a-number") };
        assert_eq!(parse_env_or("RELAY_TEST_PARSE_GARBAGE", 7usize), 7);
    }

    #[test]
    fn parse_env_or_reads_value() {
        // SAFETY: the var name is unique to this test; nothing reads it concurrently.
        unsafe { std::env::set_var("RELAY_TEST_PARSE_VALUE", "256") };
        assert_eq!(parse_env_or("RELAY_TEST_PARSE_VALUE", 7usize), 256);
    }

    #[test]
    fn flag_env_recognizes_negatives() {
        // SAFETY: the var name is unique to this test; nothing reads it concurrently.
        unsafe { std::env::set_var("RELAY_TEST_FLAG_OFF", "false") };
        assert!(!flag_env_or("RELAY_TEST_FLAG_OFF", true));

        // SAFETY: as above.
        unsafe { std::env::set_var("RELAY_TEST_FLAG_ON", "1") };
        assert!(flag_env_or("RELAY_TEST_FLAG_ON", false));

        // SAFETY: as above.
        unsafe { std::env::remove_var("RELAY_TEST_FLAG_DEFAULT") };
        assert!(flag_env_or("RELAY_TEST_FLAG_DEFAULT", true));
    }
}
