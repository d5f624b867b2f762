//! The relay core — platform-agnostic orchestration.
//!
//! Every inbound event from either platform flows through:
//! 1. `LoopGuard` — drop the relay's own reflected output
//! 2. `DedupLedger` — drop redeliveries of already-relayed messages
//! 3. identity resolution + attachment classification
//! 4. the opposite platform's send path, with bounded retry
//!
//! Platform wire formats never enter this module; bindings in `channels`
//! translate to and from the types in `types`.

pub mod attachment;
pub mod dedup;
pub mod engine;
pub mod guard;
pub mod identity;
pub mod types;
