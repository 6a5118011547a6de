//! Map Surface - the rendering collaborator the engine writes through
//!
//! The engine never holds rendering state. Every visible effect (markers,
//! labels, trails, connectors, info panel) goes through [`MapSurface`], and
//! the UI toggles the engine branches on are read back through it.
//!
//! [`RecordingSurface`] is the reference implementation: it keeps a call log
//! plus the resulting scene so hosts and tests can assert on both.

use crate::report::{GeoPoint, IdentityKey, ObjectId, Report};
use crate::trackview_space::HeadId;
use crate::wire::BoundingBox;
use h3o::CellIndex;
use std::collections::{HashMap, HashSet};

/// Rendering operations and UI queries used by the engine.
pub trait MapSurface {
    fn show_marker(&mut self, head: HeadId, report: &Report) -> Result<(), SurfaceError>;
    fn replace_marker(&mut self, head: HeadId, report: &Report) -> Result<(), SurfaceError>;
    fn hide_marker(&mut self, head: HeadId) -> Result<(), SurfaceError>;
    fn render_as_dot(&mut self, head: HeadId) -> Result<(), SurfaceError>;
    fn set_marker_opacity(&mut self, head: HeadId, opacity: f32) -> Result<(), SurfaceError>;
    fn assign_sector(&mut self, head: HeadId, sector: CellIndex) -> Result<(), SurfaceError>;

    fn attach_label(&mut self, identity: IdentityKey, head: HeadId) -> Result<(), SurfaceError>;
    fn move_label(&mut self, identity: IdentityKey, head: HeadId) -> Result<(), SurfaceError>;
    fn hide_label(&mut self, identity: IdentityKey) -> Result<(), SurfaceError>;

    fn attach_direction(&mut self, head: HeadId, course: f64) -> Result<(), SurfaceError>;
    fn remove_direction(&mut self, head: HeadId) -> Result<(), SurfaceError>;

    fn attach_trail(
        &mut self,
        identity: IdentityKey,
        points: &[GeoPoint],
    ) -> Result<(), SurfaceError>;
    fn extend_trail(&mut self, identity: IdentityKey, point: GeoPoint) -> Result<(), SurfaceError>;
    fn hide_trail(&mut self, identity: IdentityKey) -> Result<(), SurfaceError>;

    fn attach_connector(
        &mut self,
        owner: IdentityKey,
        related: IdentityKey,
        from: GeoPoint,
        to: GeoPoint,
    ) -> Result<(), SurfaceError>;
    fn hide_connector(&mut self, owner: IdentityKey) -> Result<(), SurfaceError>;

    /// Re-keys label, trail and owned connector from one identity to another.
    fn transplant(&mut self, from: IdentityKey, to: IdentityKey) -> Result<(), SurfaceError>;

    fn move_info_panel(&mut self, from: HeadId, to: HeadId) -> Result<(), SurfaceError>;

    /// Removes everything from the map.
    fn clear(&mut self) -> Result<(), SurfaceError>;

    // === UI queries ===

    fn is_info_panel_open(&self, head: HeadId) -> bool;
    fn ghosts_visible(&self) -> bool;
    fn filter_mode_active(&self) -> bool;
    fn zoom(&self) -> u8;
    fn viewport(&self) -> Option<BoundingBox>;
}

// ============================================================================
// DUPLICATE DETECTION
// ============================================================================

/// Decides whether a live report repeats one already shown.
pub trait DuplicateDetector {
    fn is_duplicate(&self, report: &Report) -> bool;

    /// Called for every accepted live report.
    fn record(&mut self, _report: &Report) {}

    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DuplicateKey {
    object_id: ObjectId,
    position: (i64, i64),
    reported_timestamp: Option<i64>,
    course: Option<u64>,
}

/// Remembers recently accepted reports for a sliding window.
///
/// Two reports are duplicates when they come from the same object, sit on
/// the same position at 5 decimals, and carry the same reported time and
/// course. Digipeated copies of one packet match this way.
#[derive(Debug, Clone)]
pub struct RecentReportCache {
    window_secs: i64,
    seen: HashMap<DuplicateKey, i64>,
}

impl RecentReportCache {
    const PRUNE_THRESHOLD: usize = 4096;

    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            seen: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn key(report: &Report) -> Option<DuplicateKey> {
        let position = report.position()?;
        Some(DuplicateKey {
            object_id: report.object_id,
            position: position.rounded(5),
            reported_timestamp: report.reported_timestamp,
            course: report.course.map(f64::to_bits),
        })
    }
}

impl Default for RecentReportCache {
    fn default() -> Self {
        Self::new(30)
    }
}

impl DuplicateDetector for RecentReportCache {
    fn is_duplicate(&self, report: &Report) -> bool {
        let Some(key) = Self::key(report) else {
            return false;
        };
        match self.seen.get(&key) {
            Some(&seen_at) => (report.timestamp - seen_at).abs() <= self.window_secs,
            None => false,
        }
    }

    fn record(&mut self, report: &Report) {
        let Some(key) = Self::key(report) else {
            return;
        };
        self.seen.insert(key, report.timestamp);

        if self.seen.len() > Self::PRUNE_THRESHOLD {
            let horizon = report.timestamp - self.window_secs;
            self.seen.retain(|_, seen_at| *seen_at >= horizon);
        }
    }

    fn reset(&mut self) {
        self.seen.clear();
    }
}

// ============================================================================
// RECORDING SURFACE
// ============================================================================

/// One call made against a [`RecordingSurface`].
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    ShowMarker(HeadId),
    ReplaceMarker(HeadId),
    HideMarker(HeadId),
    RenderAsDot(HeadId),
    SetOpacity(HeadId, f32),
    AssignSector(HeadId, CellIndex),
    AttachLabel(IdentityKey, HeadId),
    MoveLabel(IdentityKey, HeadId),
    HideLabel(IdentityKey),
    AttachDirection(HeadId),
    RemoveDirection(HeadId),
    AttachTrail(IdentityKey, usize),
    ExtendTrail(IdentityKey),
    HideTrail(IdentityKey),
    AttachConnector(IdentityKey, IdentityKey),
    HideConnector(IdentityKey),
    Transplant(IdentityKey, IdentityKey),
    MoveInfoPanel(HeadId, HeadId),
    Clear,
}

impl SurfaceCall {
    fn operation(&self) -> &'static str {
        match self {
            SurfaceCall::ShowMarker(_) => "show_marker",
            SurfaceCall::ReplaceMarker(_) => "replace_marker",
            SurfaceCall::HideMarker(_) => "hide_marker",
            SurfaceCall::RenderAsDot(_) => "render_as_dot",
            SurfaceCall::SetOpacity(..) => "set_marker_opacity",
            SurfaceCall::AssignSector(..) => "assign_sector",
            SurfaceCall::AttachLabel(..) => "attach_label",
            SurfaceCall::MoveLabel(..) => "move_label",
            SurfaceCall::HideLabel(_) => "hide_label",
            SurfaceCall::AttachDirection(_) => "attach_direction",
            SurfaceCall::RemoveDirection(_) => "remove_direction",
            SurfaceCall::AttachTrail(..) => "attach_trail",
            SurfaceCall::ExtendTrail(_) => "extend_trail",
            SurfaceCall::HideTrail(_) => "hide_trail",
            SurfaceCall::AttachConnector(..) => "attach_connector",
            SurfaceCall::HideConnector(_) => "hide_connector",
            SurfaceCall::Transplant(..) => "transplant",
            SurfaceCall::MoveInfoPanel(..) => "move_info_panel",
            SurfaceCall::Clear => "clear",
        }
    }
}

/// Scene state of one marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerState {
    pub visible: bool,
    pub dot: bool,
    pub opacity: f32,
    pub direction: Option<f64>,
    pub sector: Option<CellIndex>,
    pub position: Option<GeoPoint>,
}

/// In-memory surface that records every call and maintains the scene.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    calls: Vec<SurfaceCall>,
    markers: HashMap<HeadId, MarkerState>,
    labels: HashMap<IdentityKey, HeadId>,
    trails: HashMap<IdentityKey, Vec<GeoPoint>>,
    connectors: HashMap<IdentityKey, IdentityKey>,
    info_panel: Option<HeadId>,

    // === UI toggles ===
    pub ghosts_visible: bool,
    pub filter_mode: bool,
    pub zoom: u8,
    pub viewport: Option<BoundingBox>,

    /// Operations that fail when called
    failing: HashSet<&'static str>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self {
            ghosts_visible: true,
            zoom: 10,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> &[SurfaceCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<SurfaceCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn marker(&self, head: HeadId) -> Option<&MarkerState> {
        self.markers.get(&head)
    }

    pub fn visible_markers(&self) -> usize {
        self.markers.values().filter(|m| m.visible).count()
    }

    pub fn label(&self, identity: IdentityKey) -> Option<HeadId> {
        self.labels.get(&identity).copied()
    }

    pub fn trail(&self, identity: IdentityKey) -> Option<&[GeoPoint]> {
        self.trails.get(&identity).map(Vec::as_slice)
    }

    pub fn connector(&self, owner: IdentityKey) -> Option<IdentityKey> {
        self.connectors.get(&owner).copied()
    }

    pub fn open_info_panel(&mut self, head: HeadId) {
        self.info_panel = Some(head);
    }

    pub fn info_panel(&self) -> Option<HeadId> {
        self.info_panel
    }

    /// Makes every later call of `operation` fail.
    pub fn fail_on(&mut self, operation: &'static str) {
        self.failing.insert(operation);
    }

    pub fn heal(&mut self) {
        self.failing.clear();
    }

    fn record(&mut self, call: SurfaceCall) -> Result<(), SurfaceError> {
        let operation = call.operation();
        if self.failing.contains(operation) {
            return Err(SurfaceError::rejected(operation, "injected fault"));
        }
        self.calls.push(call);
        Ok(())
    }

    fn marker_mut(&mut self, head: HeadId) -> Result<&mut MarkerState, SurfaceError> {
        self.markers.get_mut(&head).ok_or(SurfaceError::UnknownMarker(head))
    }
}

impl MapSurface for RecordingSurface {
    fn show_marker(&mut self, head: HeadId, report: &Report) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::ShowMarker(head))?;
        let marker = self.markers.entry(head).or_insert(MarkerState {
            visible: true,
            dot: false,
            opacity: 1.0,
            direction: None,
            sector: None,
            position: None,
        });
        marker.visible = true;
        marker.position = report.position();
        Ok(())
    }

    fn replace_marker(&mut self, head: HeadId, report: &Report) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::ReplaceMarker(head))?;
        self.marker_mut(head)?.position = report.position();
        Ok(())
    }

    fn hide_marker(&mut self, head: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::HideMarker(head))?;
        self.marker_mut(head)?.visible = false;
        Ok(())
    }

    fn render_as_dot(&mut self, head: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::RenderAsDot(head))?;
        self.marker_mut(head)?.dot = true;
        Ok(())
    }

    fn set_marker_opacity(&mut self, head: HeadId, opacity: f32) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::SetOpacity(head, opacity))?;
        self.marker_mut(head)?.opacity = opacity;
        Ok(())
    }

    fn assign_sector(&mut self, head: HeadId, sector: CellIndex) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::AssignSector(head, sector))?;
        self.marker_mut(head)?.sector = Some(sector);
        Ok(())
    }

    fn attach_label(&mut self, identity: IdentityKey, head: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::AttachLabel(identity, head))?;
        self.labels.insert(identity, head);
        Ok(())
    }

    fn move_label(&mut self, identity: IdentityKey, head: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::MoveLabel(identity, head))?;
        self.labels.insert(identity, head);
        Ok(())
    }

    fn hide_label(&mut self, identity: IdentityKey) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::HideLabel(identity))?;
        self.labels.remove(&identity);
        Ok(())
    }

    fn attach_direction(&mut self, head: HeadId, course: f64) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::AttachDirection(head))?;
        self.marker_mut(head)?.direction = Some(course);
        Ok(())
    }

    fn remove_direction(&mut self, head: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::RemoveDirection(head))?;
        self.marker_mut(head)?.direction = None;
        Ok(())
    }

    fn attach_trail(
        &mut self,
        identity: IdentityKey,
        points: &[GeoPoint],
    ) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::AttachTrail(identity, points.len()))?;
        self.trails.insert(identity, points.to_vec());
        Ok(())
    }

    fn extend_trail(&mut self, identity: IdentityKey, point: GeoPoint) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::ExtendTrail(identity))?;
        self.trails
            .get_mut(&identity)
            .ok_or_else(|| SurfaceError::rejected("extend_trail", "trail not attached"))?
            .push(point);
        Ok(())
    }

    fn hide_trail(&mut self, identity: IdentityKey) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::HideTrail(identity))?;
        self.trails.remove(&identity);
        Ok(())
    }

    fn attach_connector(
        &mut self,
        owner: IdentityKey,
        related: IdentityKey,
        _from: GeoPoint,
        _to: GeoPoint,
    ) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::AttachConnector(owner, related))?;
        self.connectors.insert(owner, related);
        Ok(())
    }

    fn hide_connector(&mut self, owner: IdentityKey) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::HideConnector(owner))?;
        self.connectors.remove(&owner);
        Ok(())
    }

    fn transplant(&mut self, from: IdentityKey, to: IdentityKey) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::Transplant(from, to))?;
        if let Some(head) = self.labels.remove(&from) {
            self.labels.insert(to, head);
        }
        if let Some(trail) = self.trails.remove(&from) {
            self.trails.entry(to).or_insert(trail);
        }
        if let Some(related) = self.connectors.remove(&from) {
            self.connectors.insert(to, related);
        }
        for related in self.connectors.values_mut() {
            if *related == from {
                *related = to;
            }
        }
        Ok(())
    }

    fn move_info_panel(&mut self, from: HeadId, to: HeadId) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::MoveInfoPanel(from, to))?;
        if self.info_panel == Some(from) {
            self.info_panel = Some(to);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::Clear)?;
        self.markers.clear();
        self.labels.clear();
        self.trails.clear();
        self.connectors.clear();
        self.info_panel = None;
        Ok(())
    }

    fn is_info_panel_open(&self, head: HeadId) -> bool {
        self.info_panel == Some(head)
    }

    fn ghosts_visible(&self) -> bool {
        self.ghosts_visible
    }

    fn filter_mode_active(&self) -> bool {
        self.filter_mode
    }

    fn zoom(&self) -> u8 {
        self.zoom
    }

    fn viewport(&self) -> Option<BoundingBox> {
        self.viewport
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by a map surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SurfaceError {
    #[error("Surface rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Unknown marker: {0}")]
    UnknownMarker(HeadId),
}

impl SurfaceError {
    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        SurfaceError::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}
