//! Duplex message channel abstraction for the TrackView session.

use async_trait::async_trait;
use crate::error::EnvError;

/// Ready state of the underlying channel, as a WebSocket reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Handshake still in flight; sends must wait
    Connecting,

    /// Writable
    Open,

    /// Close requested by either side; nothing more will be delivered
    Closing,

    /// Fully closed
    Closed,
}

impl ReadyState {
    /// True once the channel can no longer carry outbound traffic.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadyState::Closing | ReadyState::Closed)
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Events observed on the receive side of a channel.
///
/// The host translates its socket callbacks into these and feeds them to
/// the session in the order they occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The handshake completed
    Open,

    /// One inbound text frame
    Message(String),

    /// The peer or the host closed the channel
    Closed {
        code: Option<u16>,
        reason: String,
    },

    /// Transport-level failure
    Error(String),
}

/// Abstraction for the outbound half of one persistent duplex channel.
///
/// # Implementations
///
/// - **Production**: the host application's WebSocket wrapper
/// - **Simulation**: `SimChannel`, an in-memory channel with a scripted
///   ready state and a log of every frame written
///
/// # Flow
///
/// ```text
/// Session                   Channel                    Server
///   |-- send_text(json) ------>|                          |
///   |                          |------------------------->|
///   |<-- ChannelEvent (host) --|<-------------------------|
/// ```
#[async_trait]
pub trait DuplexChannel: Send + Sync + 'static {
    /// Returns the current ready state.
    fn ready_state(&self) -> ReadyState;

    /// Writes one text frame.
    ///
    /// # Returns
    /// * `Ok(())` - Frame handed to the transport
    /// * `Err(EnvError)` - Immediate failure; the caller decides whether to
    ///   drop the frame
    async fn send_text(&self, text: String) -> Result<(), EnvError>;

    /// Requests the channel to close. Idempotent.
    fn close(&self);
}
