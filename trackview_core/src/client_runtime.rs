//! Client Runtime - wires session, scheduler and engine together.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TrackViewClient                         │
//! │                                                               │
//! │  DuplexChannel ──► ConnectionSession ──► SessionEvent (mpsc) │
//! │                          ▲                      │             │
//! │                          │ flush()              ▼ pump()      │
//! │                   outbound queue          TaskScheduler       │
//! │                                                 │ run()       │
//! │                                                 ▼             │
//! │                                           TrackEngine ──► MapSurface
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackview_core::client_runtime::TrackViewClient;
//! use trackview_core::{RecordingSurface, TrackViewConfig};
//! use trackview_env::TokioContext;
//!
//! let config = TrackViewConfig::default();
//! let mut client = TrackViewClient::with_surface(ctx, channel, config, RecordingSurface::new())?;
//! client.handle_channel_event(event);
//! client.tick().await?;
//! ```
//!
//! Reports and resets share the normal lane so a reset lands exactly
//! between the batches around it. Viewport culls go to the low lane.

use crate::config::TrackViewConfig;
use crate::surface::{DuplicateDetector, MapSurface, RecentReportCache};
use crate::trackview_scheduler::{Priority, TaskScheduler};
use crate::trackview_session::{
    ChannelListener, ConnectionSession, SessionError, SessionEvent, SessionState,
};
use crate::trackview_tracking::{EngineError, TrackEngine};
use crate::wire::PositionRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use trackview_env::{ChannelEvent, DuplexChannel, TrackViewContext};

/// What one `tick` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub scheduled: usize,
    pub turns: usize,
    pub sent: usize,
    pub heartbeat: bool,
}

/// A TrackView client generic over clock, channel, surface and detector.
pub struct TrackViewClient<Ctx, Ch, S, D = RecentReportCache>
where
    Ctx: TrackViewContext,
    Ch: DuplexChannel,
    S: MapSurface,
    D: DuplicateDetector,
{
    context: Arc<Ctx>,
    session: ConnectionSession<Ctx, Ch>,
    scheduler: TaskScheduler<Ctx, TrackEngine<S, D>>,
    engine: TrackEngine<S, D>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    tick_count: u64,
}

impl<Ctx, Ch, S> TrackViewClient<Ctx, Ch, S, RecentReportCache>
where
    Ctx: TrackViewContext,
    Ch: DuplexChannel,
    S: MapSurface + 'static,
{
    /// Client with the built-in duplicate detector.
    pub fn with_surface(
        context: Arc<Ctx>,
        channel: Arc<Ch>,
        config: TrackViewConfig,
        surface: S,
    ) -> Result<Self, EngineError> {
        let detector = RecentReportCache::new(config.engine.duplicate_window_secs);
        Self::new(context, channel, config, surface, detector)
    }
}

impl<Ctx, Ch, S, D> TrackViewClient<Ctx, Ch, S, D>
where
    Ctx: TrackViewContext,
    Ch: DuplexChannel,
    S: MapSurface + 'static,
    D: DuplicateDetector + 'static,
{
    pub fn new(
        context: Arc<Ctx>,
        channel: Arc<Ch>,
        config: TrackViewConfig,
        surface: S,
        detector: D,
    ) -> Result<Self, EngineError> {
        let engine = TrackEngine::new(config.engine.clone(), surface, detector)?;
        let scheduler = TaskScheduler::new(context.clone(), config.scheduler.clone());
        let mut session = ConnectionSession::new(context.clone(), channel, config.session.clone());

        let (listener, events) = ChannelListener::pair();
        session.add_listener(Box::new(listener));

        Ok(Self {
            context,
            session,
            scheduler,
            engine,
            events,
            tick_count: 0,
        })
    }

    pub fn session(&self) -> &ConnectionSession<Ctx, Ch> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConnectionSession<Ctx, Ch> {
        &mut self.session
    }

    pub fn engine(&self) -> &TrackEngine<S, D> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TrackEngine<S, D> {
        &mut self.engine
    }

    pub fn scheduler(&self) -> &TaskScheduler<Ctx, TrackEngine<S, D>> {
        &self.scheduler
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn now_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Feeds one socket event into the session.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        self.session.handle_channel_event(event);
    }

    /// Moves pending session events into the scheduler. Returns the number
    /// of tasks submitted.
    pub fn pump(&mut self) -> usize {
        let mut submitted = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Reports { reports, filtered } => {
                    debug!(count = reports.len(), filtered, "scheduling reports");
                    for report in reports {
                        self.scheduler.submit(Priority::Normal, "ingest_report", move |engine| {
                            engine.ingest(report)?;
                            Ok(())
                        });
                        submitted += 1;
                    }
                }
                SessionEvent::Reset => {
                    self.scheduler.submit(Priority::Normal, "reset", |engine| {
                        engine.reset()?;
                        Ok(())
                    });
                    submitted += 1;
                }
                SessionEvent::StateChanged { from, to } => {
                    info!(?from, ?to, tick = self.tick_count, "client observed state change");
                }
                SessionEvent::ServerTime { offset_ms } => {
                    debug!(offset_ms, "server clock offset updated");
                }
            }
        }
        submitted
    }

    /// Culls the map to a new viewport and requests its reports.
    ///
    /// Returns false if the position request repeated the previous one.
    pub fn set_viewport(&mut self, request: PositionRequest) -> Result<bool, SessionError> {
        let bounds = request.bounds;
        let key = bounds.fingerprint();
        self.scheduler.submit_if_distinct(Priority::Low, "cull_viewport", &key, move |engine| {
            engine.cull_to_viewport(bounds)?;
            Ok(())
        });
        self.session.request_position(request)
    }

    /// One host run-loop step: timers, event pump, scheduler, send queue.
    pub async fn tick(&mut self) -> Result<TickSummary, SessionError> {
        self.tick_count += 1;
        let heartbeat = self.session.poll_timers()?;
        let scheduled = self.pump();
        let turns = self.scheduler.run(&mut self.engine).await;
        let sent = self.session.flush().await?;

        Ok(TickSummary {
            scheduled,
            turns,
            sent,
            heartbeat,
        })
    }
}
