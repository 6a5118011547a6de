//! TrackView Core - Live APRS Track Reconciliation
//!
//! This library keeps a map of many moving stations consistent while its
//! input is live, duplicate-prone and unordered at the margins:
//! 1. **Scheduler**: a cooperative, priority-laned queue that sequences every
//!    reaction and yields back to the host run-loop under bursts
//! 2. **Session**: a state machine over one duplex channel with request
//!    de-duplication, a position heartbeat and a staleness watchdog
//! 3. **Engine**: incremental reconciliation of reports into trail heads,
//!    dots, ghosts, trails and cross-identity connectors

pub mod client_runtime;
pub mod config;
pub mod report;
pub mod surface;
pub mod trackview_scheduler;
pub mod trackview_session;
pub mod trackview_space;
pub mod trackview_tracking;
pub mod wire;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use client_runtime::{TickSummary, TrackViewClient};
pub use config::{ConfigError, EngineConfig, SchedulerConfig, SessionConfig, TrackViewConfig};
pub use report::{Classification, GeoPoint, IdentityKey, ObjectId, Report, SenderId, SequenceRole};
pub use surface::{
    DuplicateDetector, MapSurface, RecentReportCache, RecordingSurface, SurfaceCall, SurfaceError,
};
pub use trackview_scheduler::{Priority, SchedulerStats, TaskError, TaskScheduler, TurnOutcome};
pub use trackview_session::{
    ChannelListener, ConnectionSession, SessionError, SessionEvent, SessionListener, SessionState,
    SessionStats,
};
pub use trackview_space::{
    Connector, DisplayClass, HeadId, MarkerRegistry, RegistryError, TrailHead,
};
pub use trackview_tracking::{
    AcceptAction, EngineError, EngineStats, IngestOutcome, RejectReason, TrackEngine,
};
pub use wire::{
    BoundingBox, DecodedFrame, InboundMessage, OutboundRequest, PositionRequest, WireError,
};
