//! Error types for the relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors. Fatal at startup, before the engine exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Platform binding errors outside the send path.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Attachment fetch failed for {filename}: {reason}")]
    AttachmentFetch { filename: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Outbound delivery errors, classified for the retry policy.
///
/// `RateLimited` and `Network` are transient and eligible for retry;
/// `Rejected` is permanent and drops the unit immediately.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Rate limited on {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error on {name}: {reason}")]
    Network { name: String, reason: String },

    #[error("{name} rejected the payload: {reason}")]
    Rejected { name: String, reason: String },
}

impl SendError {
    /// Whether the retry policy should attempt this send again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Server-provided retry delay, when the platform sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Avatar/identity lookup degradation. Never fatal — the relay falls back
/// to a default identity and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Avatar lookup failed on {platform}: {reason}")]
    AvatarLookup { platform: String, reason: String },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient() {
        let err = SendError::RateLimited {
            name: "telegram".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn network_error_is_transient_without_retry_after() {
        let err = SendError::Network {
            name: "discord".into(),
            reason: "connection reset".into(),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn rejection_is_permanent() {
        let err = SendError::Rejected {
            name: "discord".into(),
            reason: "payload too large".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.retry_after(), None);
    }
}
