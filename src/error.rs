//! Crate error type.
//!
//! Only synchronous input rejection surfaces as a typed error; collaborator
//! failures (usage fetch, invoice generation, suspend/resume RPC) stay
//! `anyhow::Error` and are consumed at the call site — logged, tallied, and
//! retried on the next natural tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    /// Malformed input rejected before any scheduling side effect occurred.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timezone string from config could not be resolved.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

impl AutomationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
