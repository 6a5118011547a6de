//! TrackView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the TrackView session,
//! scheduler and engine run against a real runtime (tokio + a WebSocket the
//! host owns) or against the deterministic simulation harness.
//!
//! # What is intercepted
//!
//! - Time (`now()`, `sleep()`, `yield_now()`)
//! - The duplex message channel (`ready_state()`, `send_text()`, `close()`)
//!
//! Inbound traffic is not pulled through the channel trait. The host owns
//! the socket's receive side and hands each [`ChannelEvent`] to the session,
//! which keeps the session itself free of any I/O loop.
//!
//! # Example
//!
//! ```ignore
//! use trackview_env::{TrackViewContext, ChannelEvent};
//!
//! async fn host_loop<Ctx: TrackViewContext>(ctx: &Ctx, client: &mut Client) {
//!     loop {
//!         tokio::select! {
//!             event = socket.next_event() => client.handle_channel_event(event),
//!             _ = ctx.sleep(Duration::from_millis(250)) => client.tick().await,
//!         }
//!     }
//! }
//! ```

mod channel;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use channel::{ChannelEvent, DuplexChannel, ReadyState};
pub use context::TrackViewContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::SessionId;
