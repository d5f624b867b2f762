//! Bridgebot — bidirectional Discord ↔ Telegram message relay.

pub mod channels;
pub mod config;
pub mod error;
pub mod relay;
