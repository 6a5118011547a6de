//! The "SESSION" - Connection State Machine over one Duplex Channel
//!
//! Owns the outbound request queue and two timers:
//! - the position-request heartbeat, which re-sends a refresh variant of the
//!   latest viewport request so reports dropped under load resurface
//! - the staleness watchdog, which closes a channel whose peer went silent
//!
//! The session never reconnects. A forced close surfaces as a state
//! transition; the host observes it and opens a new channel.

use crate::config::SessionConfig;
use crate::report::Report;
use crate::wire::{self, InboundMessage, OutboundRequest, PositionRequest, WireError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use trackview_env::{ChannelEvent, DuplexChannel, EnvError, ReadyState, SessionId, TrackViewContext};

/// Connection state, local and server-reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Connected,
    Loading,
    LoadingDone,
    ListeningUpstream,
    ConnectingUpstream,
    Idle,
    Inactive,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// Maps a server status code. Unknown codes yield None.
    pub fn from_status_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SessionState::Connected),
            2 => Some(SessionState::Loading),
            3 => Some(SessionState::LoadingDone),
            4 => Some(SessionState::ListeningUpstream),
            5 => Some(SessionState::ConnectingUpstream),
            6 => Some(SessionState::Idle),
            7 => Some(SessionState::Inactive),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u8> {
        match self {
            SessionState::Connected => Some(1),
            SessionState::Loading => Some(2),
            SessionState::LoadingDone => Some(3),
            SessionState::ListeningUpstream => Some(4),
            SessionState::ConnectingUpstream => Some(5),
            SessionState::Idle => Some(6),
            SessionState::Inactive => Some(7),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed | SessionState::Error)
    }

    /// A fresh server-side session forgets what was already sent.
    fn resets_request_cache(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Inactive)
    }
}

/// Notifications pushed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Reports {
        reports: Vec<Report>,
        filtered: bool,
    },
    Reset,
    ServerTime {
        offset_ms: i64,
    },
}

/// Observer for session events. Listeners run in registration order.
pub trait SessionListener: Send {
    fn on_event(&mut self, event: &SessionEvent) -> Result<(), SessionError>;
}

/// Forwards every event into a tokio channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Creates a listener and the receiver it feeds.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl SessionListener for ChannelListener {
    fn on_event(&mut self, event: &SessionEvent) -> Result<(), SessionError> {
        self.tx
            .send(event.clone())
            .map_err(|_| SessionError::Listener("event receiver dropped".to_string()))
    }
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub reports_received: u64,
    pub requests_suppressed: u64,
    pub requests_sent: u64,
    pub requests_dropped: u64,
    pub heartbeats: u64,
    pub watchdog_closes: u64,
    pub listener_failures: u64,
}

struct QueuedRequest {
    kind: &'static str,
    text: String,
}

struct LastPosition {
    canonical: String,
    request: PositionRequest,
}

pub struct ConnectionSession<Ctx: TrackViewContext, Ch: DuplexChannel> {
    id: SessionId,
    context: Arc<Ctx>,
    channel: Arc<Ch>,
    config: SessionConfig,
    state: SessionState,
    listeners: Vec<Box<dyn SessionListener>>,
    outbound: VecDeque<QueuedRequest>,

    /// De-duplication cache: the last distinct position request accepted
    last_position: Option<LastPosition>,
    heartbeat_due: Option<Duration>,

    last_inbound: Duration,
    server_offset_ms: Option<i64>,
    stats: SessionStats,
}

impl<Ctx: TrackViewContext, Ch: DuplexChannel> ConnectionSession<Ctx, Ch> {
    pub fn new(context: Arc<Ctx>, channel: Arc<Ch>, config: SessionConfig) -> Self {
        let now = context.now();
        Self {
            id: SessionId::new(),
            context,
            channel,
            config,
            state: SessionState::Connecting,
            listeners: Vec::new(),
            outbound: VecDeque::new(),
            last_position: None,
            heartbeat_due: None,
            last_inbound: now,
            server_offset_ms: None,
            stats: SessionStats::default(),
        }
    }

    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Server clock minus local clock, once a timestamp echo arrived.
    pub fn server_offset_ms(&self) -> Option<i64> {
        self.server_offset_ms
    }

    /// Queued outbound frames, oldest first.
    pub fn pending_requests(&self) -> impl Iterator<Item = &str> {
        self.outbound.iter().map(|q| q.text.as_str())
    }

    pub fn pending_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn add_listener(&mut self, listener: Box<dyn SessionListener>) {
        self.listeners.push(listener);
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Applies one event from the host's socket.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                self.last_inbound = self.context.now();
                self.transition(SessionState::Connected);
            }
            ChannelEvent::Message(text) => {
                self.last_inbound = self.context.now();
                self.stats.messages_received += 1;
                match wire::decode(&text) {
                    Ok(frame) => {
                        if frame.skipped > 0 {
                            self.stats.decode_failures += frame.skipped as u64;
                            warn!(
                                session = %self.id,
                                skipped = frame.skipped,
                                "dropping undecodable batch reports"
                            );
                        }
                        self.handle_message(frame.message);
                    }
                    Err(e) => {
                        self.stats.decode_failures += 1;
                        warn!(session = %self.id, error = %e, "dropping undecodable message");
                    }
                }
            }
            ChannelEvent::Closed { code, reason } => {
                info!(session = %self.id, ?code, %reason, "channel closed");
                self.drop_queue();
                self.transition(SessionState::Closed);
            }
            ChannelEvent::Error(reason) => {
                warn!(session = %self.id, %reason, "channel error");
                self.drop_queue();
                self.transition(SessionState::Error);
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Report(report) => self.emit_reports(vec![report], false),
            InboundMessage::Batch(reports) => self.emit_reports(reports, false),
            InboundMessage::FilterBatch(reports) => self.emit_reports(reports, true),
            InboundMessage::Status(code) => match SessionState::from_status_code(code) {
                Some(state) if !self.state.is_terminal() => self.transition(state),
                Some(_) => trace!(session = %self.id, code, "status after close ignored"),
                None => debug!(session = %self.id, code, "ignoring unknown status code"),
            },
            InboundMessage::Reset => self.emit(SessionEvent::Reset),
            InboundMessage::TimeEcho { server_time_ms, client_time_ms } => {
                let offset_ms = self.clock_offset(server_time_ms, client_time_ms);
                self.server_offset_ms = Some(offset_ms);
                debug!(session = %self.id, offset_ms, "server clock offset");
                self.emit(SessionEvent::ServerTime { offset_ms });
            }
        }
    }

    /// Offset against the midpoint of the round trip when the echo carries
    /// our send time, else against the receive time.
    fn clock_offset(&self, server_time_ms: i64, client_time_ms: Option<i64>) -> i64 {
        let now_ms = self
            .context
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let local_ms = match client_time_ms {
            Some(sent) if sent <= now_ms => sent + (now_ms - sent) / 2,
            _ => now_ms,
        };
        server_time_ms - local_ms
    }

    fn emit_reports(&mut self, reports: Vec<Report>, filtered: bool) {
        if reports.is_empty() {
            return;
        }
        self.stats.reports_received += reports.len() as u64;
        self.emit(SessionEvent::Reports { reports, filtered });
    }

    fn emit(&mut self, event: SessionEvent) {
        for listener in self.listeners.iter_mut() {
            if let Err(e) = listener.on_event(&event) {
                self.stats.listener_failures += 1;
                warn!(session = %self.id, error = %e, "session listener failed");
            }
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(session = %self.id, ?from, ?to, "session state changed");

        if to.resets_request_cache() {
            self.last_position = None;
            self.heartbeat_due = None;
        }
        self.emit(SessionEvent::StateChanged { from, to });
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Queues a viewport/position request unless it equals the last one.
    ///
    /// Returns false for a suppressed duplicate. A distinct request re-arms
    /// the heartbeat.
    pub fn request_position(&mut self, request: PositionRequest) -> Result<bool, SessionError> {
        let request = PositionRequest { refresh: false, ..request };
        let message = OutboundRequest::Position(request.clone());
        let canonical = message.canonical()?;

        if matches!(&self.last_position, Some(last) if last.canonical == canonical) {
            self.stats.requests_suppressed += 1;
            trace!(session = %self.id, "suppressed repeated position request");
            return Ok(false);
        }

        self.outbound.push_back(QueuedRequest {
            kind: message.kind(),
            text: canonical.clone(),
        });
        self.last_position = Some(LastPosition { canonical, request });
        self.heartbeat_due = Some(self.context.now() + self.config.heartbeat_interval());
        Ok(true)
    }

    pub fn request_filter_ids(&mut self, ids: Vec<u64>) -> Result<(), SessionError> {
        self.enqueue(OutboundRequest::FilterIds { ids })
    }

    pub fn request_filter_names(&mut self, names: Vec<String>) -> Result<(), SessionError> {
        self.enqueue(OutboundRequest::FilterNames { names })
    }

    pub fn request_history(&mut self, object_id: u64) -> Result<(), SessionError> {
        self.enqueue(OutboundRequest::History { object_id })
    }

    pub fn stop_filter(&mut self) -> Result<(), SessionError> {
        self.enqueue(OutboundRequest::StopFilter)
    }

    fn enqueue(&mut self, message: OutboundRequest) -> Result<(), SessionError> {
        let text = message.canonical()?;
        self.outbound.push_back(QueuedRequest {
            kind: message.kind(),
            text,
        });
        Ok(())
    }

    /// Fires the heartbeat if due. Returns true if a refresh was queued.
    pub fn poll_timers(&mut self) -> Result<bool, SessionError> {
        let now = self.context.now();
        let due = match self.heartbeat_due {
            Some(due) if now >= due => due,
            _ => return Ok(false),
        };
        let Some(last) = &self.last_position else {
            self.heartbeat_due = None;
            return Ok(false);
        };

        let refresh = OutboundRequest::Position(last.request.refresh_variant());
        self.enqueue(refresh)?;
        self.stats.heartbeats += 1;

        let interval = self.config.heartbeat_interval();
        let mut next = due + interval;
        if next <= now {
            next = now + interval;
        }
        self.heartbeat_due = Some(next);
        debug!(session = %self.id, "position heartbeat queued");
        Ok(true)
    }

    /// True once the peer has been silent past the staleness limit.
    pub fn is_stale(&self) -> bool {
        self.context.now().saturating_sub(self.last_inbound) >= self.config.stale_after()
    }

    /// Drains the send queue one frame at a time.
    ///
    /// Waits for a connecting channel in `send_poll_interval` steps, drops
    /// everything once the channel is closing or closed, and closes a stale
    /// channel instead of sending. Returns the number of frames sent.
    pub async fn flush(&mut self) -> Result<usize, SessionError> {
        let mut sent = 0;

        while !self.outbound.is_empty() {
            if self.is_stale() {
                self.stats.watchdog_closes += 1;
                warn!(
                    session = %self.id,
                    silent_secs = self.context.now().saturating_sub(self.last_inbound).as_secs(),
                    "peer silent, closing channel"
                );
                self.force_close();
                return Ok(sent);
            }

            match self.channel.ready_state() {
                ReadyState::Open => {
                    let Some(queued) = self.outbound.pop_front() else {
                        break;
                    };
                    match self.channel.send_text(queued.text).await {
                        Ok(()) => {
                            sent += 1;
                            self.stats.requests_sent += 1;
                            trace!(session = %self.id, kind = queued.kind, "request sent");
                        }
                        Err(e) => {
                            self.stats.requests_dropped += 1;
                            warn!(
                                session = %self.id,
                                kind = queued.kind,
                                error = %e,
                                "send failed"
                            );
                        }
                    }
                }
                ReadyState::Connecting => {
                    self.context.sleep(self.config.send_poll_interval()).await;
                }
                ReadyState::Closing | ReadyState::Closed => {
                    debug!(
                        session = %self.id,
                        dropped = self.outbound.len(),
                        "channel gone, dropping queue"
                    );
                    self.drop_queue();
                    break;
                }
            }
        }

        Ok(sent)
    }

    /// Host-initiated close.
    pub fn close(&mut self) {
        self.channel.close();
        self.drop_queue();
        self.transition(SessionState::Closing);
    }

    fn force_close(&mut self) {
        self.channel.close();
        self.drop_queue();
        self.heartbeat_due = None;
        self.transition(SessionState::Closing);
    }

    fn drop_queue(&mut self) {
        self.stats.requests_dropped += self.outbound.len() as u64;
        self.outbound.clear();
    }
}

/// Errors that can occur in the connection session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Listener error: {0}")]
    Listener(String),
}
