//! The "TRACKING" Engine - Incremental Track Reconciliation
//!
//! Consumes one report at a time, in scheduler order, and keeps the map
//! consistent without ever re-deriving it:
//!
//! 1. **Rejection filter**: malformed, duplicate, re-delivered, stale,
//!    reordered and obsolete reports are dropped before any mutation
//! 2. **Overwrite / replace**: placeholder heads yield to full history;
//!    stationary heads refresh in place
//! 3. **Connect to previous**: new heads demote their predecessor to a dot,
//!    or bridge it with a connector across an identity change
//! 4. **Ghost scan**: isolated single-point heads orphaned by a competing
//!    identity of the same object are faded out for good

use crate::config::EngineConfig;
use crate::report::{Classification, GeoPoint, IdentityKey, ObjectId, Report, SequenceRole};
use crate::surface::{DuplicateDetector, MapSurface, RecentReportCache, SurfaceError};
use crate::trackview_scheduler::TaskError;
use crate::trackview_space::{Connector, DisplayClass, HeadId, MarkerRegistry, RegistryError};
use crate::wire::BoundingBox;
use h3o::{LatLng, Resolution};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Why a report was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Missing identity or unusable coordinates
    Malformed,
    /// Live report the duplicate detector recognized
    Duplicate,
    /// Historical replay of the head's own report from the same source
    Redelivered,
    /// Not newer than the identity's head
    Stale,
    /// Reported time earlier than the head's within the reorder window
    Reordered,
    /// Another head of the object already shows a later report
    Obsolete,
}

/// What an accepted report did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptAction {
    /// First head for the identity
    Created,
    /// New head continuing the identity's trail
    Extended,
    /// Existing head refreshed in place
    Replaced,
    /// A placeholder (or resumed identity) was transplanted onto this report
    Overwrote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Rejected(RejectReason),
    Accepted(AcceptAction),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ingested: u64,
    pub rejected: HashMap<RejectReason, u64>,
    pub accepted: HashMap<AcceptAction, u64>,
    pub demoted: u64,
    pub ghosted: u64,
    pub connectors_created: u64,
    pub connectors_removed: u64,
    pub resets: u64,
    pub reclassified_starts: u64,
}

impl EngineStats {
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    pub fn accepted(&self, action: AcceptAction) -> u64 {
        self.accepted.get(&action).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// Heads shown and hidden by a viewport cull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullSummary {
    pub shown: usize,
    pub hidden: usize,
}

pub struct TrackEngine<S: MapSurface, D: DuplicateDetector = RecentReportCache> {
    config: EngineConfig,
    registry: MarkerRegistry,
    surface: S,
    detector: D,

    /// Object currently being bulk-loaded (between Start and Terminal)
    sequence: Option<ObjectId>,

    /// Label moves held back while their object is mid-sequence
    deferred_labels: HashMap<IdentityKey, HeadId>,

    /// Overwritten head whose open info panel follows the next head
    pending_info_panel: Option<HeadId>,

    stats: EngineStats,
}

impl<S: MapSurface> TrackEngine<S, RecentReportCache> {
    /// Engine with the built-in duplicate detector.
    pub fn with_surface(config: EngineConfig, surface: S) -> Result<Self, EngineError> {
        let detector = RecentReportCache::new(config.duplicate_window_secs);
        Self::new(config, surface, detector)
    }
}

impl<S: MapSurface, D: DuplicateDetector> TrackEngine<S, D> {
    pub fn new(config: EngineConfig, surface: S, detector: D) -> Result<Self, EngineError> {
        let resolution = Resolution::try_from(config.sector_resolution)
            .map_err(|e| EngineError::InvalidConfig(format!("sector_resolution: {:?}", e)))?;
        Ok(Self {
            config,
            registry: MarkerRegistry::new(resolution),
            surface,
            detector,
            sequence: None,
            deferred_labels: HashMap::new(),
            pending_info_panel: None,
            stats: EngineStats::default(),
        })
    }

    pub fn registry(&self) -> &MarkerRegistry {
        &self.registry
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Object currently mid-sequence, if any.
    pub fn sequence_object(&self) -> Option<ObjectId> {
        self.sequence
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Processes one report.
    ///
    /// Expected conditions (malformed, stale, duplicate...) come back as
    /// `Rejected`. Only map surface faults are errors.
    pub fn ingest(&mut self, report: Report) -> Result<IngestOutcome, EngineError> {
        self.stats.ingested += 1;
        let role = self.resolve_role(&report);

        let outcome = match self.admit(&report, role) {
            Err(reason) => {
                *self.stats.rejected.entry(reason).or_default() += 1;
                trace!(
                    object = %report.object_id,
                    ts = report.timestamp,
                    ?reason,
                    "report rejected"
                );
                if role == SequenceRole::Terminal && self.sequence == Some(report.object_id) {
                    self.end_sequence()?;
                }
                IngestOutcome::Rejected(reason)
            }
            Ok(()) => {
                if role == SequenceRole::Start {
                    self.begin_sequence(report.object_id)?;
                }
                if !report.is_historical {
                    self.detector.record(&report);
                }
                let action = self.apply(&report)?;
                *self.stats.accepted.entry(action).or_default() += 1;
                if role == SequenceRole::Terminal && self.sequence == Some(report.object_id) {
                    self.end_sequence()?;
                }
                IngestOutcome::Accepted(action)
            }
        };

        Ok(outcome)
    }

    /// A continuation with nothing tracked starts a new sequence.
    ///
    /// This keeps a burst alive when its first report was rejected; it can
    /// also hide a burst whose start arrived out of order.
    fn resolve_role(&mut self, report: &Report) -> SequenceRole {
        match report.sequence_role {
            SequenceRole::Continuation if self.sequence.is_none() => {
                self.stats.reclassified_starts += 1;
                debug!(
                    object = %report.object_id,
                    ts = report.timestamp,
                    "continuation without tracked sequence, treating as start"
                );
                SequenceRole::Start
            }
            role => role,
        }
    }

    fn begin_sequence(&mut self, object: ObjectId) -> Result<(), EngineError> {
        if self.sequence.is_some_and(|current| current != object) {
            self.end_sequence()?;
        }
        self.sequence = Some(object);
        Ok(())
    }

    fn end_sequence(&mut self) -> Result<(), EngineError> {
        self.sequence = None;
        let mut pending: Vec<(IdentityKey, HeadId)> = self.deferred_labels.drain().collect();
        pending.sort_by_key(|(identity, _)| identity.0);
        for (identity, head) in pending {
            if self.registry.head(head).is_some_and(|h| h.display != DisplayClass::Ghost) {
                self.apply_label(identity, head)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // REJECTION FILTER
    // ========================================================================

    fn admit(&self, report: &Report, role: SequenceRole) -> Result<(), RejectReason> {
        let identity = report.identity.ok_or(RejectReason::Malformed)?;
        report.position().ok_or(RejectReason::Malformed)?;

        let current = self.registry.current_head(identity);

        if let Some(head) = current {
            let safety_valve =
                role == SequenceRole::Terminal && self.sequence == Some(report.object_id);
            if !safety_valve {
                if !report.is_historical {
                    if self.detector.is_duplicate(report) {
                        return Err(RejectReason::Duplicate);
                    }
                } else if !report.is_upstream()
                    && head.report.source_id == report.source_id
                    && head.report.report_id == report.report_id
                {
                    return Err(RejectReason::Redelivered);
                }
            }

            if head.placeholder && head.report.report_id != report.report_id {
                return Ok(());
            }
            if report.timestamp <= head.timestamp() {
                return Err(RejectReason::Stale);
            }
            let reported = (report.reported_timestamp, head.report.reported_timestamp);
            if let (Some(new), Some(old)) = reported {
                if (new - old).abs() <= self.config.reorder_window_secs && new < old {
                    return Err(RejectReason::Reordered);
                }
            }
        }

        if report.is_moving {
            let own = current.map(|h| h.id);
            let obsolete = self.registry.group_heads(report.object_id).any(|h| {
                Some(h.id) != own
                    && h.display != DisplayClass::Ghost
                    && !h.placeholder
                    && h.timestamp() > report.timestamp
            });
            if obsolete {
                return Err(RejectReason::Obsolete);
            }
        }

        Ok(())
    }

    // ========================================================================
    // APPLY
    // ========================================================================

    fn apply(&mut self, report: &Report) -> Result<AcceptAction, EngineError> {
        let identity = report.identity.ok_or(RegistryError::MissingIdentity)?;

        if report.is_overwrite {
            return self.apply_placeholder(identity, report);
        }

        let overwrote = match self.overwrite_candidate(identity, report) {
            Some(old) => {
                self.overwrite(old, identity, report)?;
                true
            }
            None => false,
        };

        let action = if report.is_moving {
            self.apply_moving(identity, report)?
        } else {
            self.apply_stationary(identity, report)?
        };

        if let Some(from) = self.pending_info_panel.take() {
            if let Some(to) = self.registry.current_head(identity).map(|h| h.id) {
                self.surface.move_info_panel(from, to)?;
            }
        }

        Ok(if overwrote { AcceptAction::Overwrote } else { action })
    }

    /// Latest-only report: refresh the live head in place or create a
    /// placeholder. Placeholders get no trail, links or ghost scan.
    fn apply_placeholder(
        &mut self,
        identity: IdentityKey,
        report: &Report,
    ) -> Result<AcceptAction, EngineError> {
        let live = self.registry.current_head(identity).filter(|h| h.is_live());
        if let Some(id) = live.map(|h| h.id) {
            self.replace_in_place(id, report)?;
            if let Some(head) = self.registry.head_mut(id) {
                head.placeholder = true;
            }
            return Ok(AcceptAction::Replaced);
        }

        self.create_head(identity, report, true)?;
        Ok(AcceptAction::Created)
    }

    fn apply_stationary(
        &mut self,
        identity: IdentityKey,
        report: &Report,
    ) -> Result<AcceptAction, EngineError> {
        let live = self
            .registry
            .current_head(identity)
            .filter(|h| h.is_live() && !h.placeholder)
            .map(|h| h.id);

        match live {
            Some(id) => {
                self.replace_in_place(id, report)?;
                Ok(AcceptAction::Replaced)
            }
            None => {
                self.create_head(identity, report, false)?;
                Ok(AcceptAction::Created)
            }
        }
    }

    fn apply_moving(
        &mut self,
        identity: IdentityKey,
        report: &Report,
    ) -> Result<AcceptAction, EngineError> {
        let previous = self.registry.current_head(identity).map(|h| h.id);
        let predecessor = self.find_predecessor(identity, report);

        let id = self.create_head(identity, report, false)?;
        let position = self.head_position(id)?;
        self.extend_trail(identity, position)?;

        if let Some(pred) = predecessor {
            self.link(pred, id, identity, report)?;
        }
        if let Some(prev) = previous {
            self.demote_to_dot(prev)?;
        }
        if report.is_confirmed() {
            self.ghost_scan(identity, id, report)?;
        }

        Ok(if previous.is_some() {
            AcceptAction::Extended
        } else {
            AcceptAction::Created
        })
    }

    fn replace_in_place(&mut self, id: HeadId, report: &Report) -> Result<(), EngineError> {
        let sector = self.registry.reposition(id, report)?;
        self.surface.replace_marker(id, report)?;
        self.surface.assign_sector(id, sector)?;
        self.update_direction(id, report)?;
        Ok(())
    }

    fn create_head(
        &mut self,
        identity: IdentityKey,
        report: &Report,
        placeholder: bool,
    ) -> Result<HeadId, EngineError> {
        let id = self.registry.insert_head(report, placeholder)?;
        let sector = self.head_sector(id)?;
        self.surface.show_marker(id, report)?;
        self.surface.assign_sector(id, sector)?;
        self.update_direction(id, report)?;
        self.place_label(identity, id, report.object_id)?;
        debug!(head = %id, %identity, object = %report.object_id, placeholder, "head created");
        Ok(id)
    }

    fn update_direction(&mut self, id: HeadId, report: &Report) -> Result<(), EngineError> {
        let had = self.registry.head(id).is_some_and(|h| h.has_direction);
        match report.course.filter(|_| report.is_moving) {
            Some(course) => {
                self.surface.attach_direction(id, course)?;
                self.set_direction_flag(id, true);
            }
            None if had => {
                self.surface.remove_direction(id)?;
                self.set_direction_flag(id, false);
            }
            None => {}
        }
        Ok(())
    }

    fn set_direction_flag(&mut self, id: HeadId, value: bool) {
        if let Some(head) = self.registry.head_mut(id) {
            head.has_direction = value;
        }
    }

    fn head_position(&self, id: HeadId) -> Result<GeoPoint, EngineError> {
        Ok(self.registry.head(id).ok_or(RegistryError::UnknownHead(id))?.position)
    }

    fn head_sector(&self, id: HeadId) -> Result<h3o::CellIndex, EngineError> {
        Ok(self.registry.head(id).ok_or(RegistryError::UnknownHead(id))?.sector)
    }

    fn extend_trail(&mut self, identity: IdentityKey, point: GeoPoint) -> Result<(), EngineError> {
        let len = self.registry.extend_trail(identity, point);
        if len == 2 {
            if let Some(trail) = self.registry.trail(identity) {
                self.surface.attach_trail(identity, trail.points())?;
            }
        } else if len > 2 {
            self.surface.extend_trail(identity, point)?;
        }
        Ok(())
    }

    // ========================================================================
    // LABELS
    // ========================================================================

    fn place_label(
        &mut self,
        identity: IdentityKey,
        head: HeadId,
        object: ObjectId,
    ) -> Result<(), EngineError> {
        if self.sequence == Some(object) {
            self.deferred_labels.insert(identity, head);
            return Ok(());
        }
        self.apply_label(identity, head)
    }

    fn apply_label(&mut self, identity: IdentityKey, head: HeadId) -> Result<(), EngineError> {
        if self.surface.zoom() < self.config.label_min_zoom {
            return Ok(());
        }
        match self.registry.label(identity) {
            Some(current) if current == head => {}
            Some(_) => self.surface.move_label(identity, head)?,
            None => self.surface.attach_label(identity, head)?,
        }
        self.registry.set_label(identity, head);
        Ok(())
    }

    fn drop_label(&mut self, identity: IdentityKey) -> Result<(), EngineError> {
        self.deferred_labels.remove(&identity);
        if self.registry.remove_label(identity).is_some() {
            self.surface.hide_label(identity)?;
        }
        Ok(())
    }

    // ========================================================================
    // OVERWRITE
    // ========================================================================

    /// A placeholder head of the same identity, or another identity's live
    /// head that this report resumes after a long gap.
    fn overwrite_candidate(&self, identity: IdentityKey, report: &Report) -> Option<HeadId> {
        match self.registry.current_head(identity) {
            Some(head) if head.placeholder => return Some(head.id),
            Some(_) => return None,
            None => {}
        }

        let position = report.position()?;
        let decimals = self.config.resume_round_decimals;
        self.registry
            .group_heads(report.object_id)
            .filter(|h| h.identity != identity && h.is_live())
            .filter(|h| {
                report.timestamp - h.timestamp() > self.config.resume_gap_secs
                    && h.position.rounded(decimals) == position.rounded(decimals)
                    && h.report.symbol.is_some()
                    && h.report.symbol == report.symbol
            })
            .max_by_key(|h| (h.timestamp(), h.id))
            .map(|h| h.id)
    }

    fn overwrite(
        &mut self,
        old: HeadId,
        identity: IdentityKey,
        report: &Report,
    ) -> Result<(), EngineError> {
        let (old_identity, info_open) = {
            let head = self.registry.head(old).ok_or(RegistryError::UnknownHead(old))?;
            (head.identity, self.surface.is_info_panel_open(old))
        };

        if old_identity != identity {
            if let Some(head) = self.deferred_labels.remove(&old_identity) {
                self.deferred_labels.insert(identity, head);
            }
            self.registry.transplant(old_identity, identity);
            self.surface.transplant(old_identity, identity)?;
        } else if report.is_historical {
            // The replay brings the whole trail again
            self.tear_down_history(identity)?;
        }

        self.forget_head(old, identity)?;
        if info_open {
            self.pending_info_panel = Some(old);
        }

        info!(%old_identity, %identity, head = %old, "placeholder overwritten");
        Ok(())
    }

    /// Drops the identity's trail and dots.
    fn tear_down_history(&mut self, identity: IdentityKey) -> Result<(), EngineError> {
        let dots: Vec<HeadId> = self
            .registry
            .demoted(identity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for dot in &dots {
            self.forget_head(*dot, identity)?;
        }
        if self.registry.clear_trail(identity) >= 2 {
            self.surface.hide_trail(identity)?;
        }
        debug!(%identity, dots = dots.len(), "history torn down");
        Ok(())
    }

    /// Hides a head and removes it from the registry.
    ///
    /// The label stays keyed by the identity and follows its next head.
    fn forget_head(&mut self, id: HeadId, identity: IdentityKey) -> Result<(), EngineError> {
        if self.registry.head(id).is_some_and(|h| h.has_direction) {
            self.surface.remove_direction(id)?;
        }
        self.surface.hide_marker(id)?;

        let label_on_head = self.registry.label(identity) == Some(id);
        self.registry.remove_head(id);
        if label_on_head {
            self.registry.set_label(identity, id);
        }
        Ok(())
    }

    // ========================================================================
    // CONNECT TO PREVIOUS
    // ========================================================================

    /// The head this report continues from.
    fn find_predecessor(&self, identity: IdentityKey, report: &Report) -> Option<HeadId> {
        let object = report.object_id;
        if let Some(live) = self.registry.latest_live_head(object) {
            if live.identity == identity {
                return Some(live.id);
            }
        }

        self.registry
            .group_heads(object)
            .filter(|h| {
                h.is_live()
                    && h.classification.is_confirmed()
                    && h.report.is_moving
                    && !h.placeholder
                    && !self.registry.is_isolated(h.identity)
            })
            .max_by_key(|h| (h.timestamp(), h.id))
            .map(|h| h.id)
    }

    fn link(
        &mut self,
        pred: HeadId,
        new: HeadId,
        identity: IdentityKey,
        report: &Report,
    ) -> Result<(), EngineError> {
        let (pred_identity, pred_ts, pred_pos) = {
            let head = self.registry.head(pred).ok_or(RegistryError::UnknownHead(pred))?;
            (head.identity, head.timestamp(), head.position)
        };

        if pred_identity == identity {
            return self.demote_chain(pred);
        }

        if report.timestamp - pred_ts <= self.config.connector_horizon_secs {
            let to = self.head_position(new)?;
            self.create_connector(Connector {
                owner: pred_identity,
                related: identity,
                from: pred_pos,
                to,
                created_at: report.timestamp,
            })?;
        }

        if report.is_confirmed() {
            self.demote_to_dot(pred)?;
            self.drop_label(pred_identity)?;
        }
        Ok(())
    }

    fn create_connector(&mut self, connector: Connector) -> Result<(), EngineError> {
        let (owner, related) = (connector.owner, connector.related);
        let (from, to) = (connector.from, connector.to);
        if self.registry.remove_connector(owner).is_some() {
            self.surface.hide_connector(owner)?;
            self.stats.connectors_removed += 1;
        }
        self.registry.set_connector(connector);
        self.surface.attach_connector(owner, related, from, to)?;
        self.stats.connectors_created += 1;
        debug!(%owner, %related, "connector created");
        Ok(())
    }

    fn remove_connector(&mut self, owner: IdentityKey) -> Result<(), EngineError> {
        if self.registry.remove_connector(owner).is_some() {
            self.surface.hide_connector(owner)?;
            self.stats.connectors_removed += 1;
        }
        Ok(())
    }

    /// Demotes a head and, one level up, the head bridged into it.
    fn demote_chain(&mut self, id: HeadId) -> Result<(), EngineError> {
        let identity = match self.registry.head(id) {
            Some(head) => head.identity,
            None => return Ok(()),
        };
        self.demote_to_dot(id)?;

        for owner in self.registry.inbound_connectors(identity) {
            if let Some(ancestor) = self.registry.current_head(owner).map(|h| h.id) {
                self.demote_to_dot(ancestor)?;
            }
        }
        Ok(())
    }

    /// Turns a live head into a trail dot. Dots and ghosts are left alone.
    ///
    /// Returns true if the head changed.
    pub fn demote_to_dot(&mut self, id: HeadId) -> Result<bool, EngineError> {
        let (identity, object, had_direction) = match self.registry.head_mut(id) {
            Some(head) if head.display == DisplayClass::Head => {
                head.display = DisplayClass::Dot;
                let had = head.has_direction;
                head.has_direction = false;
                (head.identity, head.object_id, had)
            }
            _ => return Ok(false),
        };

        self.registry.mark_demoted(identity, id);
        self.surface.render_as_dot(id)?;
        if had_direction {
            self.surface.remove_direction(id)?;
        }
        self.follow_info_panel(id, object)?;

        self.stats.demoted += 1;
        trace!(head = %id, %identity, "demoted to dot");
        Ok(true)
    }

    fn follow_info_panel(&mut self, from: HeadId, object: ObjectId) -> Result<(), EngineError> {
        if !self.surface.is_info_panel_open(from) {
            return Ok(());
        }
        if let Some(to) = self.registry.latest_live_head(object).map(|h| h.id) {
            if to != from {
                self.surface.move_info_panel(from, to)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // GHOST SCAN
    // ========================================================================

    fn ghost_scan(
        &mut self,
        identity: IdentityKey,
        new: HeadId,
        report: &Report,
    ) -> Result<(), EngineError> {
        let object = report.object_id;

        let contested = self.registry.group_heads(object).any(|h| {
            h.is_live()
                && h.identity != identity
                && h.report.is_moving
                && !self.registry.bridged(h.identity, identity)
        });
        if !contested {
            return Ok(());
        }

        let candidates: Vec<(HeadId, IdentityKey)> = self
            .registry
            .group_heads(object)
            .filter(|h| {
                h.id != new
                    && h.is_live()
                    && h.identity != identity
                    && h.classification.is_confirmed()
                    && h.report.is_moving
                    && !h.placeholder
                    && h.timestamp() <= report.timestamp
                    && self.registry.is_isolated(h.identity)
            })
            .map(|h| (h.id, h.identity))
            .collect();

        for (candidate, candidate_identity) in candidates {
            if let Some(related) = self.registry.connector(candidate_identity).map(|c| c.related) {
                let shared = related != identity
                    && self
                        .registry
                        .current_head(related)
                        .is_some_and(|h| h.is_live() && h.visible);
                if shared {
                    trace!(
                        head = %candidate,
                        %related,
                        "ghost candidate shares a live connector, skipped"
                    );
                    continue;
                }
                self.remove_connector(candidate_identity)?;
            }
            self.ghost(candidate)?;
        }
        Ok(())
    }

    fn ghost(&mut self, id: HeadId) -> Result<(), EngineError> {
        let (identity, had_direction) = match self.registry.head_mut(id) {
            Some(head) if head.display == DisplayClass::Head => {
                head.display = DisplayClass::Ghost;
                head.classification = Classification::Abnormal;
                let had = head.has_direction;
                head.has_direction = false;
                (head.identity, had)
            }
            _ => return Ok(()),
        };

        self.surface.set_marker_opacity(id, self.config.ghost_opacity)?;
        let labelled = self.registry.label(identity) == Some(id)
            || self.deferred_labels.get(&identity) == Some(&id);
        if labelled {
            self.drop_label(identity)?;
        }
        if had_direction {
            self.surface.remove_direction(id)?;
        }
        if !self.surface.ghosts_visible() {
            self.surface.hide_marker(id)?;
            if let Some(head) = self.registry.head_mut(id) {
                head.visible = false;
            }
        }

        self.stats.ghosted += 1;
        debug!(head = %id, %identity, "head ghosted");
        Ok(())
    }

    // ========================================================================
    // RESET AND VIEWPORT
    // ========================================================================

    /// Forgets every head, trail and connector.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.surface.clear()?;
        self.registry.clear();
        self.detector.reset();
        self.sequence = None;
        self.deferred_labels.clear();
        self.pending_info_panel = None;
        self.stats.resets += 1;
        info!("track engine reset");
        Ok(())
    }

    /// Shows heads whose sector center falls inside the margin-expanded
    /// viewport and hides the rest. Filter mode shows everything.
    pub fn cull_to_viewport(&mut self, bounds: BoundingBox) -> Result<CullSummary, EngineError> {
        let filter_mode = self.surface.filter_mode_active();
        let ghosts_visible = self.surface.ghosts_visible();
        let area = bounds.expanded(self.config.sector_margin_deg);

        let mut changes: Vec<(HeadId, bool)> = Vec::new();
        for (cell, ids) in self.registry.sectors() {
            let center = LatLng::from(cell);
            let in_view = filter_mode || area.contains(center.lat(), center.lng());
            for id in ids {
                let Some(head) = self.registry.head(*id) else {
                    continue;
                };
                let want = in_view && (head.display != DisplayClass::Ghost || ghosts_visible);
                if want != head.visible {
                    changes.push((*id, want));
                }
            }
        }
        changes.sort_by_key(|(id, _)| *id);

        let mut summary = CullSummary::default();
        for (id, visible) in changes {
            let report = match self.registry.head(id) {
                Some(head) => head.report.clone(),
                None => continue,
            };
            if visible {
                self.surface.show_marker(id, &report)?;
                summary.shown += 1;
            } else {
                self.surface.hide_marker(id)?;
                summary.hidden += 1;
            }
            if let Some(head) = self.registry.head_mut(id) {
                head.visible = visible;
            }
        }

        debug!(shown = summary.shown, hidden = summary.hidden, "viewport culled");
        Ok(summary)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that can occur during track reconciliation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{RecordingSurface, SurfaceCall};
    use proptest::prelude::*;
    use std::collections::HashSet;

    const A: IdentityKey = IdentityKey(1);
    const B: IdentityKey = IdentityKey(2);
    const C: IdentityKey = IdentityKey(3);
    const OBJ: ObjectId = ObjectId(42);

    fn engine() -> TrackEngine<RecordingSurface> {
        TrackEngine::with_surface(EngineConfig::default(), RecordingSurface::new()).unwrap()
    }

    fn moving(identity: IdentityKey, ts: i64, lat: f64) -> Report {
        Report::new(identity, OBJ, ts, lat, 18.0).moving()
    }

    fn accepted(action: AcceptAction) -> IngestOutcome {
        IngestOutcome::Accepted(action)
    }

    fn rejected(reason: RejectReason) -> IngestOutcome {
        IngestOutcome::Rejected(reason)
    }

    /// R1..R3 for identity A: start, continuation, terminal.
    fn simple_trail(engine: &mut TrackEngine<RecordingSurface>) {
        let r1 = moving(A, 100, 59.00).with_role(SequenceRole::Start);
        let r2 = moving(A, 110, 59.01).with_role(SequenceRole::Continuation);
        let r3 = moving(A, 120, 59.02).with_role(SequenceRole::Terminal);
        assert_eq!(engine.ingest(r1).unwrap(), accepted(AcceptAction::Created));
        assert_eq!(engine.ingest(r2).unwrap(), accepted(AcceptAction::Extended));
        assert_eq!(engine.ingest(r3).unwrap(), accepted(AcceptAction::Extended));
    }

    fn live_of(engine: &TrackEngine<RecordingSurface>, identity: IdentityKey) -> Vec<HeadId> {
        engine
            .registry()
            .heads()
            .filter(|h| h.identity == identity && h.is_live())
            .map(|h| h.id)
            .collect()
    }

    #[test]
    fn test_simple_trail() {
        let mut engine = engine();
        simple_trail(&mut engine);

        let reg = engine.registry();
        let head = reg.current_head(A).unwrap();
        assert_eq!(head.display, DisplayClass::Head);
        assert_eq!(head.timestamp(), 120);
        assert_eq!(reg.trail_len(A), 3);
        assert_eq!(live_of(&engine, A), vec![head.id]);
        assert_eq!(reg.count_by_class(DisplayClass::Dot), 2);
        assert_eq!(engine.surface().trail(A).map(|t| t.len()), Some(3));
        assert!(engine.sequence_object().is_none());

        // Label held back during the burst, attached once at the end
        assert_eq!(engine.surface().label(A), Some(head.id));
        let label_calls = engine
            .surface()
            .calls()
            .iter()
            .filter(|c| matches!(c, SurfaceCall::AttachLabel(..) | SurfaceCall::MoveLabel(..)))
            .count();
        assert_eq!(label_calls, 1);
    }

    #[test]
    fn test_identity_rollover() {
        let mut engine = engine();
        simple_trail(&mut engine);
        let a_head = engine.registry().current_head(A).unwrap().id;

        let r4 = moving(B, 130, 59.03).with_role(SequenceRole::Start);
        assert_eq!(engine.ingest(r4).unwrap(), accepted(AcceptAction::Created));

        let reg = engine.registry();
        assert_eq!(reg.head(a_head).unwrap().display, DisplayClass::Dot);
        let connector = reg.connector(A).unwrap();
        assert_eq!(connector.related, B);
        assert_eq!(reg.current_head(B).unwrap().display, DisplayClass::Head);
        assert_eq!(engine.surface().connector(A), Some(B));
        assert!(live_of(&engine, A).is_empty());
    }

    #[test]
    fn test_stale_rejection_leaves_state_untouched() {
        let mut engine = engine();
        simple_trail(&mut engine);
        let calls_before = engine.surface().calls().len();

        let r5 = moving(A, 115, 59.05);
        assert_eq!(engine.ingest(r5).unwrap(), rejected(RejectReason::Stale));

        assert_eq!(engine.registry().current_head(A).unwrap().timestamp(), 120);
        assert_eq!(engine.registry().trail_len(A), 3);
        assert_eq!(engine.surface().calls().len(), calls_before);
        assert_eq!(engine.stats().rejected(RejectReason::Stale), 1);
    }

    #[test]
    fn test_orphan_ghosting() {
        let mut engine = engine();
        let a = moving(A, 100, 59.00);
        let c1 = moving(C, 105, 59.10).with_classification(Classification::UnconfirmedObject);
        let c2 = moving(C, 110, 59.11);

        engine.ingest(a).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;
        assert_eq!(engine.surface().label(A), Some(a_head));
        engine.ingest(c1).unwrap();
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Head);

        engine.ingest(c2).unwrap();

        let ghost = engine.registry().head(a_head).unwrap();
        assert_eq!(ghost.display, DisplayClass::Ghost);
        assert_eq!(ghost.classification, Classification::Abnormal);
        assert_eq!(engine.surface().marker(a_head).unwrap().opacity, 0.5);
        assert!(engine.surface().label(A).is_none());
        assert!(engine.surface().marker(a_head).unwrap().visible);
        assert_eq!(engine.registry().current_head(C).unwrap().display, DisplayClass::Head);
        assert_eq!(engine.stats().ghosted, 1);
    }

    #[test]
    fn test_ghost_hidden_when_ghosts_toggled_off() {
        let mut engine = engine();
        engine.surface_mut().ghosts_visible = false;
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;
        engine
            .ingest(moving(C, 105, 59.10).with_classification(Classification::UnconfirmedObject))
            .unwrap();
        engine.ingest(moving(C, 110, 59.11)).unwrap();

        assert!(!engine.surface().marker(a_head).unwrap().visible);
        assert!(!engine.registry().head(a_head).unwrap().visible);
    }

    #[test]
    fn test_ghost_is_terminal() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;
        engine
            .ingest(moving(C, 105, 59.10).with_classification(Classification::UnconfirmedObject))
            .unwrap();
        engine.ingest(moving(C, 110, 59.11)).unwrap();

        assert!(!engine.demote_to_dot(a_head).unwrap());
        engine.ingest(moving(A, 120, 59.20)).unwrap();
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Ghost);
    }

    #[test]
    fn test_malformed_reports_absorbed() {
        let mut engine = engine();
        let mut no_identity = moving(A, 100, 59.0);
        no_identity.identity = None;
        let mut no_coords = moving(A, 100, 59.0);
        no_coords.longitude = None;
        let mut nan = moving(A, 100, 59.0);
        nan.latitude = Some(f64::NAN);

        for report in [no_identity, no_coords, nan] {
            assert_eq!(engine.ingest(report).unwrap(), rejected(RejectReason::Malformed));
        }
        assert_eq!(engine.registry().head_count(), 0);
        assert!(engine.surface().calls().is_empty());
    }

    #[test]
    fn test_live_duplicate_rejected() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.0)).unwrap();
        assert_eq!(
            engine.ingest(moving(A, 105, 59.0)).unwrap(),
            rejected(RejectReason::Duplicate)
        );
    }

    #[test]
    fn test_terminal_mid_sequence_skips_duplicate_check() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 100, 59.0).with_role(SequenceRole::Start))
            .unwrap();
        let outcome = engine
            .ingest(moving(A, 105, 59.0).with_role(SequenceRole::Terminal))
            .unwrap();
        assert_eq!(outcome, accepted(AcceptAction::Extended));
        assert!(engine.sequence_object().is_none());
    }

    #[test]
    fn test_rejected_terminal_still_ends_sequence() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 100, 59.0).with_role(SequenceRole::Start))
            .unwrap();
        let head = engine.registry().current_head(A).unwrap().id;
        assert!(engine.surface().label(A).is_none());

        let outcome = engine
            .ingest(moving(A, 90, 59.1).with_role(SequenceRole::Terminal))
            .unwrap();
        assert_eq!(outcome, rejected(RejectReason::Stale));
        assert!(engine.sequence_object().is_none());
        assert_eq!(engine.surface().label(A), Some(head));
    }

    #[test]
    fn test_continuation_without_start_begins_sequence() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 100, 59.0).with_role(SequenceRole::Continuation))
            .unwrap();
        assert_eq!(engine.sequence_object(), Some(OBJ));
        assert_eq!(engine.stats().reclassified_starts, 1);
    }

    #[test]
    fn test_historical_redelivery_rejected() {
        let mut engine = engine();
        let first = moving(A, 100, 59.0).historical().with_source(2).with_report_id(50);
        engine.ingest(first).unwrap();

        let again = moving(A, 150, 59.5).historical().with_source(2).with_report_id(50);
        assert_eq!(engine.ingest(again).unwrap(), rejected(RejectReason::Redelivered));

        let other_source = moving(A, 150, 59.5).historical().with_source(3).with_report_id(50);
        assert!(engine.ingest(other_source).unwrap().is_accepted());

        // Upstream history carries no source and is never a redelivery
        let upstream = moving(A, 200, 59.6).historical().with_report_id(50);
        assert!(engine.ingest(upstream).unwrap().is_accepted());
    }

    #[test]
    fn test_reordered_reported_time_rejected() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 100, 59.0).with_reported_timestamp(1_000))
            .unwrap();
        let outcome = engine
            .ingest(moving(A, 110, 59.1).with_reported_timestamp(990))
            .unwrap();
        assert_eq!(outcome, rejected(RejectReason::Reordered));

        // Outside the window the receive order wins
        let outcome = engine
            .ingest(moving(A, 120, 59.2).with_reported_timestamp(300))
            .unwrap();
        assert!(outcome.is_accepted());
    }

    #[test]
    fn test_obsolete_moving_report_rejected() {
        let mut engine = engine();
        engine.ingest(moving(A, 200, 59.0)).unwrap();

        assert_eq!(
            engine.ingest(moving(B, 150, 59.1)).unwrap(),
            rejected(RejectReason::Obsolete)
        );
        // Stationary reports are not checked against the group
        let parked = Report::new(B, OBJ, 150, 59.1, 18.0);
        assert_eq!(engine.ingest(parked).unwrap(), accepted(AcceptAction::Created));
    }

    #[test]
    fn test_stationary_report_replaces_in_place() {
        let mut engine = engine();
        engine.ingest(Report::new(A, OBJ, 100, 59.0, 18.0)).unwrap();
        let id = engine.registry().current_head(A).unwrap().id;

        let outcome = engine.ingest(Report::new(A, OBJ, 200, 45.0, 10.0)).unwrap();
        assert_eq!(outcome, accepted(AcceptAction::Replaced));

        let reg = engine.registry();
        assert_eq!(reg.head_count(), 1);
        assert_eq!(reg.current_head(A).unwrap().id, id);
        assert_eq!(reg.current_head(A).unwrap().position, GeoPoint::new(45.0, 10.0));
        assert_eq!(reg.trail_len(A), 0);
        assert!(engine.surface().calls().contains(&SurfaceCall::ReplaceMarker(id)));
    }

    #[test]
    fn test_placeholder_overwritten_by_history() {
        let mut engine = engine();
        let latest = moving(A, 500, 59.5).overwrite().with_report_id(9);
        assert_eq!(engine.ingest(latest).unwrap(), accepted(AcceptAction::Created));
        let placeholder = engine.registry().current_head(A).unwrap().id;
        assert!(engine.registry().head(placeholder).unwrap().placeholder);
        assert_eq!(engine.registry().trail_len(A), 0);

        let first = moving(A, 100, 59.0).historical().with_report_id(1);
        assert_eq!(engine.ingest(first).unwrap(), accepted(AcceptAction::Overwrote));

        let reg = engine.registry();
        assert!(reg.head(placeholder).is_none());
        let head = reg.current_head(A).unwrap();
        assert!(!head.placeholder);
        assert_eq!(head.timestamp(), 100);
        assert!(!engine.surface().marker(placeholder).unwrap().visible);
        assert_eq!(engine.surface().label(A), Some(head.id));

        let next = moving(A, 110, 59.1).historical().with_report_id(2);
        assert_eq!(engine.ingest(next).unwrap(), accepted(AcceptAction::Extended));
        assert_eq!(engine.registry().trail_len(A), 2);
    }

    #[test]
    fn test_history_replay_after_latest_only_rebuilds_trail() {
        let mut engine = engine();
        let history = [(100, 59.00, 1), (110, 59.01, 2), (120, 59.02, 3), (130, 59.03, 4)];
        for &(ts, lat, id) in &history[..3] {
            engine
                .ingest(moving(A, ts, lat).historical().with_report_id(id))
                .unwrap();
        }
        let latest = moving(A, 130, 59.03).overwrite().with_report_id(4);
        assert_eq!(engine.ingest(latest).unwrap(), accepted(AcceptAction::Replaced));
        assert!(engine.registry().current_head(A).unwrap().placeholder);

        let mut outcomes = Vec::new();
        for &(ts, lat, id) in &history {
            let replay = moving(A, ts, lat).historical().with_report_id(id);
            outcomes.push(engine.ingest(replay).unwrap());
        }
        assert_eq!(outcomes[0], accepted(AcceptAction::Overwrote));
        assert!(outcomes[1..].iter().all(|o| *o == accepted(AcceptAction::Extended)));

        let reg = engine.registry();
        let lats: Vec<f64> = reg.trail(A).unwrap().points().iter().map(|p| p.lat).collect();
        assert_eq!(lats, vec![59.00, 59.01, 59.02, 59.03]);
        assert_eq!(reg.head_count(), 4);
        assert_eq!(reg.count_by_class(DisplayClass::Dot), 3);
        assert_eq!(reg.demoted(A).map(|set| set.len()), Some(3));
        assert_eq!(live_of(&engine, A).len(), 1);
        assert_eq!(engine.surface().trail(A).map(|t| t.len()), Some(4));
        assert!(engine.surface().calls().contains(&SurfaceCall::HideTrail(A)));
        assert!(reg.invariant_violations().is_empty());
    }

    #[test]
    fn test_live_report_after_latest_only_keeps_trail() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        engine.ingest(moving(A, 110, 59.01)).unwrap();
        engine
            .ingest(moving(A, 120, 59.02).overwrite().with_report_id(7))
            .unwrap();

        let live = moving(A, 130, 59.03);
        assert_eq!(engine.ingest(live).unwrap(), accepted(AcceptAction::Overwrote));

        let reg = engine.registry();
        assert_eq!(reg.trail_len(A), 3);
        assert_eq!(reg.current_head(A).unwrap().timestamp(), 130);
        assert_eq!(live_of(&engine, A).len(), 1);
        assert!(!engine.surface().calls().contains(&SurfaceCall::HideTrail(A)));
    }

    #[test]
    fn test_overwrite_own_payload_is_stale() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 500, 59.5).overwrite().with_report_id(9))
            .unwrap();
        let own = moving(A, 500, 59.5).historical().with_report_id(9);
        assert_eq!(engine.ingest(own).unwrap(), rejected(RejectReason::Stale));
    }

    #[test]
    fn test_resumed_identity_overwrites_old_head() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 1_000, 59.00001).with_symbol("/>"))
            .unwrap();
        let old = engine.registry().current_head(A).unwrap().id;

        let resumed = moving(B, 1_000 + 90_000, 59.00002).with_symbol("/>");
        assert_eq!(engine.ingest(resumed).unwrap(), accepted(AcceptAction::Overwrote));

        let reg = engine.registry();
        assert!(reg.head(old).is_none());
        assert!(reg.current_head(A).is_none());
        assert_eq!(reg.trail_len(B), 2);
        assert_eq!(engine.surface().trail(B).map(|t| t.len()), Some(2));
        let new = reg.current_head(B).unwrap().id;
        assert_eq!(engine.surface().label(B), Some(new));
        assert!(engine.surface().calls().contains(&SurfaceCall::Transplant(A, B)));
    }

    #[test]
    fn test_resume_moves_old_dots_to_new_identity() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 1_000, 59.001).with_symbol("/>"))
            .unwrap();
        let dot = engine.registry().current_head(A).unwrap().id;
        engine
            .ingest(moving(A, 1_100, 59.00001).with_symbol("/>"))
            .unwrap();

        let resumed = moving(B, 1_100 + 90_000, 59.00002).with_symbol("/>");
        assert_eq!(engine.ingest(resumed).unwrap(), accepted(AcceptAction::Overwrote));

        let reg = engine.registry();
        assert!(reg.current_head(A).is_none());
        assert!(reg.heads().all(|h| h.identity == B));
        assert_eq!(reg.head(dot).unwrap().display, DisplayClass::Dot);
        let demoted: Option<Vec<HeadId>> = reg.demoted(B).map(|set| set.iter().copied().collect());
        assert_eq!(demoted, Some(vec![dot]));
        assert!(reg.demoted(A).is_none());
        assert_eq!(reg.trail_len(B), 3);
        assert_eq!(live_of(&engine, B).len(), 1);
        assert!(reg.invariant_violations().is_empty());
    }

    #[test]
    fn test_resume_requires_matching_symbol() {
        let mut engine = engine();
        engine
            .ingest(moving(A, 1_000, 59.0).with_symbol("/>"))
            .unwrap();
        let resumed = moving(B, 1_000 + 90_000, 59.0).with_symbol("/k");
        assert_eq!(engine.ingest(resumed).unwrap(), accepted(AcceptAction::Created));
        assert!(engine.registry().current_head(A).is_some());
    }

    #[test]
    fn test_new_connector_replaces_previous() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        engine.ingest(moving(A, 110, 59.01)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;

        let unconfirmed = Classification::UnconfirmedObject;
        engine
            .ingest(moving(B, 120, 59.02).with_classification(unconfirmed))
            .unwrap();
        assert_eq!(engine.registry().connector(A).unwrap().related, B);
        // Unconfirmed successors do not demote
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Head);

        engine
            .ingest(moving(C, 130, 59.03).with_classification(unconfirmed))
            .unwrap();
        assert_eq!(engine.registry().connector(A).unwrap().related, C);
        assert!(engine.surface().calls().contains(&SurfaceCall::HideConnector(A)));
        assert_eq!(engine.stats().connectors_removed, 1);
        assert!(engine.registry().invariant_violations().is_empty());
    }

    #[test]
    fn test_no_connector_beyond_horizon() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        engine.ingest(moving(A, 110, 59.01)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;

        engine.ingest(moving(B, 110 + 4_000, 59.02)).unwrap();
        assert!(engine.registry().connector(A).is_none());
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Dot);
    }

    #[test]
    fn test_same_identity_link_demotes_bridged_ancestor() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        engine.ingest(moving(A, 110, 59.01)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;

        engine
            .ingest(moving(B, 120, 59.02).with_classification(Classification::UnconfirmedObject))
            .unwrap();
        let b_first = engine.registry().current_head(B).unwrap().id;
        assert_eq!(engine.registry().connector(A).unwrap().related, B);
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Head);

        assert_eq!(
            engine.ingest(moving(B, 130, 59.03)).unwrap(),
            accepted(AcceptAction::Extended)
        );

        let reg = engine.registry();
        assert_eq!(reg.head(b_first).unwrap().display, DisplayClass::Dot);
        assert_eq!(reg.head(a_head).unwrap().display, DisplayClass::Dot);
        assert!(reg.demoted(A).unwrap().contains(&a_head));
        assert!(engine.surface().marker(a_head).unwrap().dot);
        assert_eq!(reg.connector(A).unwrap().related, B);
        assert_eq!(live_of(&engine, B), vec![reg.current_head(B).unwrap().id]);
    }

    #[test]
    fn test_ghost_scan_skips_candidate_bridged_to_live_head() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        let a_head = engine.registry().current_head(A).unwrap().id;
        engine
            .ingest(moving(B, 105, 59.05).with_classification(Classification::UnconfirmedObject))
            .unwrap();
        let b_head = engine.registry().current_head(B).unwrap().id;
        let p = GeoPoint::new(59.0, 18.0);
        engine.registry.set_connector(Connector {
            owner: A,
            related: B,
            from: p,
            to: p,
            created_at: 105,
        });

        engine.ingest(moving(C, 110, 59.10)).unwrap();
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Head);
        assert_eq!(engine.registry().connector(A).unwrap().related, B);
        assert_eq!(engine.stats().ghosted, 0);

        // Once the bridged head is hidden the candidate is an orphan again
        if let Some(head) = engine.registry.head_mut(b_head) {
            head.visible = false;
        }
        engine.ingest(moving(C, 120, 59.11)).unwrap();
        assert_eq!(engine.registry().head(a_head).unwrap().display, DisplayClass::Ghost);
        assert!(engine.registry().connector(A).is_none());
        assert_eq!(engine.stats().ghosted, 1);
    }

    #[test]
    fn test_demotion_is_idempotent() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.0)).unwrap();
        let id = engine.registry().current_head(A).unwrap().id;

        assert!(engine.demote_to_dot(id).unwrap());
        let calls = engine.surface().calls().len();
        let demoted = engine.registry().demoted(A).cloned();

        assert!(!engine.demote_to_dot(id).unwrap());
        assert_eq!(engine.surface().calls().len(), calls);
        assert_eq!(engine.registry().demoted(A).cloned(), demoted);
        assert_eq!(engine.stats().demoted, 1);
    }

    #[test]
    fn test_info_panel_follows_new_head() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        let first = engine.registry().current_head(A).unwrap().id;
        engine.surface_mut().open_info_panel(first);

        engine.ingest(moving(A, 110, 59.01)).unwrap();
        let second = engine.registry().current_head(A).unwrap().id;
        assert_eq!(engine.surface().info_panel(), Some(second));
    }

    #[test]
    fn test_direction_indicator_removed_on_demotion() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00).with_course(45.0)).unwrap();
        let first = engine.registry().current_head(A).unwrap().id;
        assert_eq!(engine.surface().marker(first).unwrap().direction, Some(45.0));

        engine.ingest(moving(A, 110, 59.01).with_course(50.0)).unwrap();
        assert!(engine.surface().marker(first).unwrap().direction.is_none());
        assert!(engine.surface().marker(first).unwrap().dot);
    }

    #[test]
    fn test_surface_fault_propagates() {
        let mut engine = engine();
        engine.ingest(moving(A, 100, 59.00)).unwrap();
        engine.surface_mut().fail_on("render_as_dot");

        let err = engine.ingest(moving(A, 110, 59.01)).unwrap_err();
        assert!(matches!(err, EngineError::Surface(SurfaceError::Rejected { .. })));
        let task_error: TaskError = err.into();
        assert!(task_error.to_string().contains("render_as_dot"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut engine = engine();
        simple_trail(&mut engine);
        engine.reset().unwrap();

        assert_eq!(engine.registry().head_count(), 0);
        assert!(engine.detector().is_empty());
        assert_eq!(engine.surface().calls().last(), Some(&SurfaceCall::Clear));
        assert_eq!(engine.surface().visible_markers(), 0);

        // Same reports are welcome again
        simple_trail(&mut engine);
    }

    #[test]
    fn test_cull_to_viewport() {
        let mut engine = engine();
        engine
            .ingest(Report::new(A, ObjectId(1), 100, 59.33, 18.07))
            .unwrap();
        engine
            .ingest(Report::new(B, ObjectId(2), 100, 57.70, 11.97))
            .unwrap();
        let stockholm = BoundingBox::new(59.5, 18.3, 59.1, 17.8);

        let summary = engine.cull_to_viewport(stockholm).unwrap();
        assert_eq!(summary, CullSummary { shown: 0, hidden: 1 });
        assert_eq!(engine.surface().visible_markers(), 1);

        // Idempotent
        assert_eq!(engine.cull_to_viewport(stockholm).unwrap(), CullSummary::default());

        engine.surface_mut().filter_mode = true;
        let summary = engine.cull_to_viewport(stockholm).unwrap();
        assert_eq!(summary, CullSummary { shown: 1, hidden: 0 });
    }

    // ========================================================================
    // PROPERTIES
    // ========================================================================

    fn arb_report() -> impl Strategy<Value = Report> {
        (
            1u64..4,
            0i64..200,
            0u32..40,
            any::<bool>(),
            1u8..6,
            1u8..4,
            any::<bool>(),
        )
            .prop_map(|(identity, ts, step, is_moving, class, role, historical)| {
                // Identities 1 and 3 share an object
                let mut report = Report::new(
                    IdentityKey(identity),
                    ObjectId(identity % 2 + 1),
                    ts,
                    59.0 + step as f64 * 0.003,
                    18.0,
                )
                .with_classification(Classification::from_code(class))
                .with_role(SequenceRole::from_code(role))
                .with_report_id(ts as u64);
                report.is_moving = is_moving;
                if historical {
                    report = report.historical().with_source(1);
                }
                report
            })
    }

    proptest! {
        #[test]
        fn prop_registry_invariants_hold(reports in prop::collection::vec(arb_report(), 1..60)) {
            let mut engine = engine();
            let mut last_accepted: HashMap<IdentityKey, i64> = HashMap::new();
            let mut ghosts: HashSet<HeadId> = HashSet::new();

            for report in reports {
                let identity = report.identity.unwrap();
                let ts = report.timestamp;
                let outcome = engine.ingest(report).unwrap();

                if outcome.is_accepted() {
                    if let Some(prev) = last_accepted.get(&identity) {
                        prop_assert!(ts > *prev, "{} accepted {} after {}", identity, ts, prev);
                    }
                    last_accepted.insert(identity, ts);
                }

                let violations = engine.registry().invariant_violations();
                prop_assert!(violations.is_empty(), "{:?}", violations);

                for id in &ghosts {
                    let head = engine.registry().head(*id);
                    prop_assert_eq!(head.map(|h| h.display), Some(DisplayClass::Ghost));
                }
                ghosts.extend(
                    engine
                        .registry()
                        .heads()
                        .filter(|h| h.display == DisplayClass::Ghost)
                        .map(|h| h.id),
                );
            }
        }

        #[test]
        fn prop_stale_report_never_mutates(lat_step in 0u32..100, back in 0i64..50) {
            let mut engine = engine();
            simple_trail(&mut engine);
            let calls = engine.surface().calls().len();
            let heads = engine.registry().head_count();

            let stale = moving(A, 120 - back, 60.0 + lat_step as f64 * 0.01);
            prop_assert!(!engine.ingest(stale).unwrap().is_accepted());
            prop_assert_eq!(engine.surface().calls().len(), calls);
            prop_assert_eq!(engine.registry().head_count(), heads);
            prop_assert_eq!(engine.registry().trail_len(A), 3);
        }
    }
}
