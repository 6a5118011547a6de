//! Scenario runner - drives a TrackView client through simulated traffic.
//!
//! Every scenario runs the production client (session, scheduler, engine)
//! against a [`SimChannel`] and a [`RecordingSurface`] on a virtual clock.
//! After each tick the runner checks the registry invariants that must
//! hold whatever the feed does:
//!
//! - at most one live head per identity
//! - a ghost never changes class again
//! - an identity's current head never moves back in time (skipped where
//!   placeholders are overwritten by older history)

use crate::channel::SimChannel;
use crate::context::SimContext;
use crate::feed::{FeedConfig, FeedOracle};
use crate::scenarios::ScenarioId;

use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trackview_core::wire::{self, BoundingBox, InboundMessage, PositionRequest, WireError};
use trackview_core::{
    AcceptAction, Classification, DisplayClass, EngineError, HeadId, IdentityKey, ObjectId,
    RecordingSurface, Report, SequenceRole, SessionError, SessionState, TickSummary,
    TrackViewClient, TrackViewConfig,
};
use trackview_env::{ChannelEvent, ReadyState};

pub type SimClient = TrackViewClient<SimContext, SimChannel, RecordingSurface>;

/// Object used by the hand-written scenario prologues, outside the range
/// the feed allocates.
const FIXED_OBJECT: ObjectId = ObjectId(900);
const A: IdentityKey = IdentityKey(1);
const B: IdentityKey = IdentityKey(2);
const C: IdentityKey = IdentityKey(3);

const TICK: Duration = Duration::from_secs(1);

/// Past the longest station interval, so every station has reported twice.
const ROLLOVER_AT_SECS: u64 = 35;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Heads in the registry at the end
    pub final_head_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Reports handed to the channel as inbound frames
    pub reports_delivered: u64,
    pub reports_accepted: u64,
    pub reports_rejected: u64,

    pub live_heads: usize,
    pub dots: usize,
    pub ghosts: usize,
    pub connectors_created: u64,

    /// Scheduler tasks that failed or panicked
    pub tasks_failed: u64,

    pub requests_sent: u64,
    pub heartbeats: u64,
    pub watchdog_closes: u64,

    /// Per-tick invariant sweeps performed
    pub invariant_checks: u64,
}

/// Errors that abort a scenario.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Assertion failed: {0}")]
    Assertion(String),
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Assertion(message()))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// One client wired to a simulated channel and clock.
pub struct SimHarness {
    context: Arc<SimContext>,
    channel: Arc<SimChannel>,
    client: SimClient,

    ghosts: HashSet<HeadId>,
    last_head_ts: HashMap<IdentityKey, i64>,
    check_monotonic: bool,
    reset_pending: bool,

    ticks: u64,
    delivered: u64,
    invariant_checks: u64,
    violations: Vec<String>,
}

impl SimHarness {
    pub fn new(seed: u64, config: TrackViewConfig) -> Result<Self, SimError> {
        let context = SimContext::shared(seed);
        let channel = Arc::new(SimChannel::new(ReadyState::Open));
        let surface = RecordingSurface::new();
        let client =
            TrackViewClient::with_surface(context.clone(), channel.clone(), config, surface)?;

        Ok(Self {
            context,
            channel,
            client,
            ghosts: HashSet::new(),
            last_head_ts: HashMap::new(),
            check_monotonic: true,
            reset_pending: false,
            ticks: 0,
            delivered: 0,
            invariant_checks: 0,
            violations: Vec::new(),
        })
    }

    pub fn client(&self) -> &SimClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SimClient {
        &mut self.client
    }

    pub fn channel(&self) -> &SimChannel {
        &self.channel
    }

    pub fn context(&self) -> &SimContext {
        &self.context
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Current virtual wall-clock time in Unix seconds.
    pub fn now_unix(&self) -> i64 {
        self.context.unix_secs()
    }

    pub fn connect(&mut self) {
        self.client.handle_channel_event(ChannelEvent::Open);
    }

    /// Encodes `message` and delivers it as an inbound frame.
    pub fn deliver(&mut self, message: InboundMessage) -> Result<(), SimError> {
        match &message {
            InboundMessage::Report(_) => self.delivered += 1,
            InboundMessage::Batch(reports) | InboundMessage::FilterBatch(reports) => {
                self.delivered += reports.len() as u64
            }
            InboundMessage::Reset => self.reset_pending = true,
            _ => {}
        }
        let text = wire::encode_inbound(&message)?;
        self.client.handle_channel_event(ChannelEvent::Message(text));
        Ok(())
    }

    pub fn deliver_batch(&mut self, reports: Vec<Report>) -> Result<(), SimError> {
        if reports.is_empty() {
            return Ok(());
        }
        self.deliver(InboundMessage::Batch(reports))
    }

    /// Advances the clock by `dt`, runs one client tick and sweeps the
    /// invariants.
    pub async fn tick(&mut self, dt: Duration) -> Result<TickSummary, SimError> {
        self.context.advance_time(dt);
        let summary = self.client.tick().await?;
        self.ticks += 1;
        self.check();
        Ok(summary)
    }

    fn check(&mut self) {
        if self.reset_pending {
            self.ghosts.clear();
            self.last_head_ts.clear();
            self.reset_pending = false;
        }

        let tick = self.ticks;
        let registry = self.client.engine().registry();
        let mut found: Vec<String> = registry
            .invariant_violations()
            .into_iter()
            .map(|v| format!("tick {}: {}", tick, v))
            .collect();

        for id in &self.ghosts {
            match registry.head(*id) {
                Some(head) if head.display == DisplayClass::Ghost => {}
                Some(head) => {
                    found.push(format!("tick {}: ghost {} became {:?}", tick, id, head.display))
                }
                None => found.push(format!("tick {}: ghost {} vanished", tick, id)),
            }
        }
        for head in registry.heads().filter(|h| h.display == DisplayClass::Ghost) {
            self.ghosts.insert(head.id);
        }

        if self.check_monotonic {
            for head in registry.heads() {
                let Some(current) = registry.current_head(head.identity) else {
                    continue;
                };
                if current.id != head.id {
                    continue;
                }
                let ts = current.timestamp();
                if let Some(previous) = self.last_head_ts.insert(head.identity, ts) {
                    if previous > ts {
                        found.push(format!(
                            "tick {}: {} head went back from {} to {}",
                            tick, head.identity, previous, ts
                        ));
                    }
                }
            }
        }

        self.invariant_checks += 1;
        for violation in &found {
            warn!("{}", violation);
        }
        self.violations.extend(found);
    }

    pub fn metrics(&self) -> ScenarioMetrics {
        let engine = self.client.engine();
        let stats = engine.stats();
        let registry = engine.registry();
        let session = self.client.session().stats();
        let scheduler = self.client.scheduler().stats();

        ScenarioMetrics {
            reports_delivered: self.delivered,
            reports_accepted: [
                AcceptAction::Created,
                AcceptAction::Extended,
                AcceptAction::Replaced,
                AcceptAction::Overwrote,
            ]
            .into_iter()
            .map(|a| stats.accepted(a))
            .sum(),
            reports_rejected: stats.total_rejected(),
            live_heads: registry.count_by_class(DisplayClass::Head),
            dots: registry.count_by_class(DisplayClass::Dot),
            ghosts: registry.count_by_class(DisplayClass::Ghost),
            connectors_created: stats.connectors_created,
            tasks_failed: scheduler.failed + scheduler.panicked,
            requests_sent: session.requests_sent,
            heartbeats: session.heartbeats,
            watchdog_closes: session.watchdog_closes,
            invariant_checks: self.invariant_checks,
        }
    }

    fn live_heads_of(&self, identity: IdentityKey) -> Vec<HeadId> {
        self.client
            .engine()
            .registry()
            .heads()
            .filter(|h| h.identity == identity && h.is_live())
            .map(|h| h.id)
            .collect()
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Duration of the load scenarios in seconds
    duration_secs: u64,

    config: TrackViewConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 120,
            config: TrackViewConfig::default(),
        }
    }

    /// Sets the duration of the load scenarios.
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_config(mut self, config: TrackViewConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut harness = match SimHarness::new(self.seed, self.config.clone()) {
            Ok(harness) => harness,
            Err(e) => {
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_head_count: 0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                }
            }
        };

        let outcome = match scenario {
            ScenarioId::SimpleTrail => self.run_simple_trail(&mut harness).await,
            ScenarioId::IdentityRollover => self.run_identity_rollover(&mut harness).await,
            ScenarioId::StaleFlood => self.run_stale_flood(&mut harness).await,
            ScenarioId::OrphanGhost => self.run_orphan_ghost(&mut harness).await,
            ScenarioId::HistoryOverwrite => self.run_history_overwrite(&mut harness).await,
            ScenarioId::Storm => self.run_storm(&mut harness).await,
            ScenarioId::SilentPeer => self.run_silent_peer(&mut harness).await,
        };

        let failure_reason = match outcome {
            Err(e) => Some(e.to_string()),
            Ok(()) => harness.violations().first().cloned(),
        };
        let passed = failure_reason.is_none();
        let metrics = harness.metrics();

        if passed {
            info!(
                "✓ {} complete: {} ticks, {} accepted, {} rejected",
                scenario.name(),
                harness.ticks(),
                metrics.reports_accepted,
                metrics.reports_rejected
            );
        } else {
            warn!("✗ {} failed: {}", scenario.name(), failure_reason.as_deref().unwrap_or(""));
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: harness.ticks(),
            final_time_secs: harness.client().now_secs(),
            final_head_count: harness.client().engine().registry().head_count(),
            failure_reason,
            metrics,
        }
    }

    fn viewport() -> PositionRequest {
        PositionRequest::new(BoundingBox::new(60.0, 19.0, 58.5, 17.0), 60)
    }

    async fn start(&self, h: &mut SimHarness) -> Result<(), SimError> {
        h.connect();
        h.client_mut().set_viewport(Self::viewport())?;
        h.tick(Duration::ZERO).await?;
        Ok(())
    }

    /// Start, continuation, terminal for identity A, 10 s apart.
    async fn simple_trail_prologue(&self, h: &mut SimHarness) -> Result<i64, SimError> {
        let base = h.now_unix();
        let reports = vec![
            Report::new(A, FIXED_OBJECT, base, 59.00, 18.0).moving().with_role(SequenceRole::Start),
            Report::new(A, FIXED_OBJECT, base + 10, 59.01, 18.0)
                .moving()
                .with_role(SequenceRole::Continuation),
            Report::new(A, FIXED_OBJECT, base + 20, 59.02, 18.0)
                .moving()
                .with_role(SequenceRole::Terminal),
        ];
        h.deliver_batch(reports)?;
        h.tick(TICK).await?;
        Ok(base)
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    async fn run_simple_trail(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-001: SimpleTrail");
        self.start(h).await?;
        let base = self.simple_trail_prologue(h).await?;

        let engine = h.client().engine();
        let registry = engine.registry();
        let head = registry
            .current_head(A)
            .ok_or_else(|| SimError::Assertion("no head for A".into()))?;
        ensure(head.display == DisplayClass::Head, || format!("A head is {:?}", head.display))?;
        ensure(head.timestamp() == base + 20, || format!("A head at {}", head.timestamp()))?;
        let trail_len = registry.trail_len(A);
        ensure(trail_len == 3, || format!("trail has {} points", trail_len))?;
        ensure(registry.count_by_class(DisplayClass::Dot) == 2, || "expected two dots".into())?;
        ensure(engine.surface().label(A) == Some(head.id), || "label not on the head".into())?;
        ensure(h.live_heads_of(A).len() == 1, || "A has several live heads".into())?;
        Ok(())
    }

    async fn run_identity_rollover(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-002: IdentityRollover");
        self.start(h).await?;
        let base = self.simple_trail_prologue(h).await?;
        let a_head = h
            .client()
            .engine()
            .registry()
            .current_head(A)
            .map(|head| head.id)
            .ok_or_else(|| SimError::Assertion("no head for A".into()))?;

        let r4 = Report::new(B, FIXED_OBJECT, base + 30, 59.03, 18.0)
            .moving()
            .with_role(SequenceRole::Start);
        h.deliver(InboundMessage::Report(r4))?;
        h.tick(TICK).await?;

        {
            let registry = h.client().engine().registry();
            let demoted = registry.head(a_head).map(|head| head.display);
            ensure(demoted == Some(DisplayClass::Dot), || format!("A head is {:?}", demoted))?;
            let related = registry.connector(A).map(|c| c.related);
            ensure(related == Some(B), || format!("A connector points at {:?}", related))?;
            ensure(h.live_heads_of(A).is_empty(), || "A still live".into())?;
            ensure(h.live_heads_of(B).len() == 1, || "B has no live head".into())?;
        }

        // Feed stations all switch identity once every one has a trail
        let mut feed = FeedOracle::new(self.seed, FeedConfig::default());
        let now = h.now_unix();
        let objects: Vec<ObjectId> = (0..5).map(|_| feed.spawn_station(true, now)).collect();
        let rollover_at = ROLLOVER_AT_SECS;
        let checked = self.duration_secs >= rollover_at + 35;
        let before = h.client().engine().stats().connectors_created;
        for second in 0..self.duration_secs {
            if second == rollover_at {
                for object in &objects {
                    let identity = feed.rollover(*object);
                    debug!(?object, ?identity, "station rolled over");
                }
            }
            let reports = feed.step(h.now_unix(), 1.0);
            h.deliver_batch(reports)?;
            h.tick(TICK).await?;
        }

        if checked {
            let created = h.client().engine().stats().connectors_created - before;
            let expected = objects.len() as u64;
            ensure(created >= expected, || format!("only {} connectors drawn", created))?;
            for station in feed.stations() {
                let history = feed.identity_history(station.object_id);
                for old in &history[..history.len().saturating_sub(1)] {
                    ensure(h.live_heads_of(*old).is_empty(), || {
                        format!("retired {} of {:?} is still live", old, station.object_id)
                    })?;
                }
                ensure(h.live_heads_of(station.identity).len() == 1, || {
                    format!("{} has no live head", station.identity)
                })?;
            }
        }
        Ok(())
    }

    async fn run_stale_flood(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-003: StaleFlood");
        self.start(h).await?;
        let base = self.simple_trail_prologue(h).await?;
        let calls_before = h.client().engine().surface().calls().len();
        let rejected_before = h.client().engine().stats().total_rejected();

        let mut rng = h.context().rng(3);
        let mut flood = Vec::new();
        for _ in 0..50 {
            let report = if rng.gen_bool(0.5) {
                // Same fix as the head, delivered again a little later
                Report::new(A, FIXED_OBJECT, base + 20 + rng.gen_range(1..10), 59.02, 18.0).moving()
            } else {
                // Late copy somewhere inside the settled trail
                let ts = base + rng.gen_range(0..=20);
                Report::new(A, FIXED_OBJECT, ts, 58.9 + rng.gen::<f64>() * 0.2, 18.0).moving()
            };
            flood.push(report);
        }
        h.deliver_batch(flood)?;
        h.tick(TICK).await?;

        let engine = h.client().engine();
        let rejected = engine.stats().total_rejected() - rejected_before;
        ensure(rejected == 50, || format!("only {} of 50 copies rejected", rejected))?;
        let head_ts = engine.registry().current_head(A).map(|head| head.timestamp());
        ensure(head_ts == Some(base + 20), || format!("A head moved to {:?}", head_ts))?;
        ensure(engine.registry().trail_len(A) == 3, || "trail changed".into())?;
        let untouched = engine.surface().calls().len() == calls_before;
        ensure(untouched, || "rejected copies touched the map".into())?;
        Ok(())
    }

    async fn run_orphan_ghost(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-004: OrphanGhost");
        self.start(h).await?;
        let base = h.now_unix();

        h.deliver(InboundMessage::Report(
            Report::new(A, FIXED_OBJECT, base, 59.00, 18.0).moving(),
        ))?;
        h.tick(TICK).await?;
        let a_head = h
            .client()
            .engine()
            .registry()
            .current_head(A)
            .map(|head| head.id)
            .ok_or_else(|| SimError::Assertion("no head for A".into()))?;

        h.deliver_batch(vec![
            Report::new(C, FIXED_OBJECT, base + 5, 59.10, 18.0)
                .moving()
                .with_classification(Classification::UnconfirmedObject),
            Report::new(C, FIXED_OBJECT, base + 10, 59.11, 18.0).moving(),
        ])?;
        h.tick(TICK).await?;

        {
            let engine = h.client().engine();
            let ghost = engine
                .registry()
                .head(a_head)
                .ok_or_else(|| SimError::Assertion("A head vanished".into()))?;
            let display = ghost.display;
            ensure(display == DisplayClass::Ghost, || format!("A head is {:?}", display))?;
            let abnormal = ghost.classification == Classification::Abnormal;
            ensure(abnormal, || "ghost not reclassified".into())?;
            let opacity = engine.surface().marker(a_head).map(|m| m.opacity);
            let faded = opacity == Some(engine.config().ghost_opacity);
            ensure(faded, || format!("ghost opacity {:?}", opacity))?;
            ensure(engine.surface().label(A).is_none(), || "ghost kept its label".into())?;
            ensure(h.live_heads_of(C).len() == 1, || "C has no live head".into())?;
        }

        // A late report for A must not revive the ghost
        h.deliver(InboundMessage::Report(
            Report::new(A, FIXED_OBJECT, base + 20, 59.20, 18.0).moving(),
        ))?;
        h.tick(TICK).await?;
        let display = h.client().engine().registry().head(a_head).map(|head| head.display);
        ensure(display == Some(DisplayClass::Ghost), || format!("ghost became {:?}", display))?;
        Ok(())
    }

    async fn run_history_overwrite(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-005: HistoryOverwrite");
        h.check_monotonic = false;
        h.connect();
        h.client_mut().set_viewport(PositionRequest {
            latest_only: true,
            ..Self::viewport()
        })?;
        h.tick(Duration::ZERO).await?;

        let mut feed = FeedOracle::new(self.seed, FeedConfig::default());
        let now = h.now_unix();
        let objects: Vec<ObjectId> = (0..3).map(|_| feed.spawn_station(true, now)).collect();
        const POINTS: usize = 5;

        let placeholders: Vec<Report> = objects
            .iter()
            .filter_map(|object| feed.placeholder_for(*object, POINTS, now))
            .collect();
        h.deliver_batch(placeholders)?;
        h.tick(TICK).await?;
        let registry = h.client().engine().registry();
        let placeholder_heads = registry.heads().filter(|head| head.placeholder).count();
        let expected = objects.len();
        ensure(placeholder_heads == expected, || format!("{} placeholders", placeholder_heads))?;

        for object in &objects {
            h.client_mut().session_mut().request_history(object.0)?;
            let burst = feed.history_burst(*object, POINTS, now, 7);
            h.deliver_batch(burst)?;
            h.tick(TICK).await?;
        }

        let engine = h.client().engine();
        let registry = engine.registry();
        ensure(registry.heads().all(|head| !head.placeholder), || "placeholder survived".into())?;
        let overwrote = engine.stats().accepted(AcceptAction::Overwrote);
        ensure(overwrote == objects.len() as u64, || format!("{} overwrites", overwrote))?;
        for object in &objects {
            let Some(station) = feed.station(*object) else {
                continue;
            };
            let identity = station.identity;
            let len = registry.trail_len(identity);
            ensure(len == POINTS, || format!("{} trail has {} points", identity, len))?;
            let ts = registry.current_head(identity).map(|head| head.timestamp());
            ensure(ts == Some(now), || format!("{} head at {:?}", identity, ts))?;
        }

        let sent = h.channel().sent();
        ensure(sent.len() == 1 + objects.len(), || format!("{} frames sent", sent.len()))?;
        Ok(())
    }

    async fn run_storm(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-006: Storm - {} s of chaotic traffic", self.duration_secs);
        self.start(h).await?;

        let mut feed = FeedOracle::new(self.seed, FeedConfig::chaotic());
        let now = h.now_unix();
        for i in 0..20 {
            feed.spawn_station(i % 4 != 0, now);
        }

        let half = PositionRequest::new(BoundingBox::new(59.8, 18.5, 59.3, 17.5), 60);
        let reset_at = self.duration_secs / 2;
        for second in 1..=self.duration_secs {
            if second % 10 == 0 {
                h.deliver(InboundMessage::Status(4))?;
            }
            if second % 30 == 0 {
                let request = if (second / 30) % 2 == 1 { half.clone() } else { Self::viewport() };
                h.client_mut().set_viewport(request)?;
            }
            if second == reset_at {
                h.deliver(InboundMessage::Reset)?;
            }

            let reports = feed.step(h.now_unix(), 1.0);
            h.deliver_batch(reports)?;
            h.tick(TICK).await?;

            if second % 30 == 0 {
                let m = h.metrics();
                debug!(
                    "  t={}s | heads={} dots={} ghosts={} | accepted={} rejected={}",
                    second, m.live_heads, m.dots, m.ghosts, m.reports_accepted, m.reports_rejected
                );
            }
        }

        let metrics = h.metrics();
        ensure(metrics.tasks_failed == 0, || format!("{} tasks failed", metrics.tasks_failed))?;
        let progressed = metrics.reports_accepted > 0 || self.duration_secs == 0;
        ensure(progressed, || "nothing accepted".into())?;
        ensure(
            metrics.reports_accepted + metrics.reports_rejected <= metrics.reports_delivered,
            || "engine saw more reports than were delivered".into(),
        )?;
        Ok(())
    }

    async fn run_silent_peer(&self, h: &mut SimHarness) -> Result<(), SimError> {
        info!("TV-007: SilentPeer");
        let session = self.config.session.clone();
        let heartbeat = session.heartbeat_interval_secs.max(1);
        let stale = session.stale_after_secs.max(1);
        let talk_until = (self.duration_secs / 2).max(heartbeat + 10);
        let deadline = talk_until + stale + 2 * heartbeat;

        self.start(h).await?;
        let server_ms = h.now_unix() * 1000 + 1500;
        h.deliver(InboundMessage::TimeEcho {
            server_time_ms: server_ms,
            client_time_ms: None,
        })?;

        let mut second = 0;
        while second < deadline && !h.client().state().is_terminal() {
            second += 1;
            if second < talk_until && second % 10 == 0 {
                h.deliver(InboundMessage::Status(4))?;
            }
            h.tick(TICK).await?;
        }

        let metrics = h.metrics();
        let offset = h.client().session().server_offset_ms();
        ensure(offset == Some(1500), || format!("server offset {:?}", offset))?;
        ensure(metrics.heartbeats >= 1, || "no heartbeat while the server talked".into())?;
        let closes = metrics.watchdog_closes;
        ensure(closes == 1, || format!("{} watchdog closes", closes))?;
        let state = h.client().state();
        ensure(state == SessionState::Closing, || format!("state {:?}", state))?;
        ensure(h.channel().close_calls() == 1, || "channel not closed once".into())?;
        let sent = h.channel().sent();
        let refreshes = sent.iter().filter(|f| f.contains("\"refresh\":true")).count();
        ensure(refreshes >= 1, || "no refresh frame reached the channel".into())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn run(scenario: ScenarioId) -> ScenarioResult {
        ScenarioRunner::new(42).with_duration(90).run(scenario).await
    }

    #[tokio::test]
    async fn test_simple_trail_passes() {
        let result = run(ScenarioId::SimpleTrail).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_head_count, 3);
        assert_eq!(result.metrics.live_heads, 1);
    }

    #[tokio::test]
    async fn test_fixed_scenarios_pass() {
        for scenario in [
            ScenarioId::IdentityRollover,
            ScenarioId::StaleFlood,
            ScenarioId::OrphanGhost,
            ScenarioId::HistoryOverwrite,
        ] {
            let result = run(scenario).await;
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[tokio::test]
    async fn test_stale_flood_counts_rejections() {
        let result = run(ScenarioId::StaleFlood).await;
        assert_eq!(result.metrics.reports_rejected, 50);
        assert_eq!(result.metrics.reports_delivered, 53);
    }

    #[tokio::test]
    async fn test_silent_peer_closes_once() {
        let result = run(ScenarioId::SilentPeer).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.watchdog_closes, 1);
        assert!(result.metrics.heartbeats >= 1);
    }

    #[tokio::test]
    async fn test_storm_is_deterministic() {
        let a = run(ScenarioId::Storm).await;
        let b = run(ScenarioId::Storm).await;
        assert_eq!(a.metrics.reports_delivered, b.metrics.reports_delivered);
        assert_eq!(a.metrics.reports_accepted, b.metrics.reports_accepted);
        assert_eq!(a.final_head_count, b.final_head_count);
        assert!(a.metrics.invariant_checks >= 90);
    }

    #[tokio::test]
    async fn test_harness_flags_bad_config() {
        let mut config = TrackViewConfig::default();
        config.engine.sector_resolution = 99;
        let result = ScenarioRunner::new(1).with_config(config).run(ScenarioId::SimpleTrail).await;
        assert!(!result.passed);
        assert_eq!(result.total_ticks, 0);
    }

    #[tokio::test]
    async fn test_result_serializes() {
        let result = run(ScenarioId::OrphanGhost).await;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scenario"], "orphan_ghost");
        assert_eq!(json["metrics"]["ghosts"], 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(6))]

        #[test]
        fn prop_storm_holds_invariants(seed in any::<u64>()) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let runner = ScenarioRunner::new(seed).with_duration(60);
            let result = runtime.block_on(runner.run(ScenarioId::Storm));
            prop_assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
        }
    }
}
