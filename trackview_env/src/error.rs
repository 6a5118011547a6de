//! Error types for the TrackView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Channel send failed (buffer full, socket gone, etc.)
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The channel is not open for writing
    #[error("Channel not open (state: {0})")]
    NotOpen(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::ChannelError(msg.into())
    }

    /// Creates a not-open error from the observed ready state.
    pub fn not_open(state: impl std::fmt::Display) -> Self {
        Self::NotOpen(state.to_string())
    }
}
