//! The "SPACE" Registry - Marker Identity, Trails, Connectors and Sectors
//!
//! Every key the engine needs to find a rendered entity again lives here:
//! - heads by [`HeadId`], the current head per identity, groups per object
//! - trail geometry, demoted-point sets and labels per identity
//! - cross-identity connectors per owning identity
//! - an H3 sector index used for viewport culling
//!
//! The registry enforces bookkeeping only. Display-class decisions belong to
//! the engine.

use crate::report::{Classification, GeoPoint, IdentityKey, ObjectId, Report};
use h3o::{CellIndex, LatLng, Resolution};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Handle of one rendered trail head. Allocated in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadId(pub u64);

impl std::fmt::Display for HeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "head:{}", self.0)
    }
}

/// How a head is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayClass {
    /// The element representing "now" for its identity
    Head,
    /// Superseded and absorbed into the trail
    Dot,
    /// Abandoned orphan; terminal
    Ghost,
}

/// Visual element created by an accepted report.
#[derive(Debug, Clone)]
pub struct TrailHead {
    pub id: HeadId,
    pub identity: IdentityKey,
    pub object_id: ObjectId,

    /// Last accepted report (replaced in place for stationary updates)
    pub report: Report,
    pub position: GeoPoint,

    pub display: DisplayClass,

    /// Working classification; ghosting rewrites it to Abnormal
    pub classification: Classification,

    /// Marked for overwrite by a later full history
    pub placeholder: bool,

    pub visible: bool,
    pub has_direction: bool,
    pub sector: CellIndex,
}

impl TrailHead {
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.report.timestamp
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.display == DisplayClass::Head
    }
}

/// Ordered polyline of accepted positions for one identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrailGeometry {
    points: Vec<GeoPoint>,
}

impl TrailGeometry {
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<GeoPoint> {
        self.points.last().copied()
    }
}

/// Dashed bridge from the last position of one identity to the first
/// position of the identity continuing the same track.
#[derive(Debug, Clone, PartialEq)]
pub struct Connector {
    pub owner: IdentityKey,
    pub related: IdentityKey,
    pub from: GeoPoint,
    pub to: GeoPoint,
    pub created_at: i64,
}

/// Statistics about the sector index.
#[derive(Debug, Clone)]
pub struct SpatialIndexStats {
    pub total_cells: usize,
    pub total_entries: usize,
    pub avg_per_cell: f64,
}

pub struct MarkerRegistry {
    heads: HashMap<HeadId, TrailHead>,
    current: HashMap<IdentityKey, HeadId>,
    groups: HashMap<ObjectId, Vec<HeadId>>,
    trails: HashMap<IdentityKey, TrailGeometry>,
    connectors: HashMap<IdentityKey, Connector>,
    demoted: HashMap<IdentityKey, BTreeSet<HeadId>>,
    labels: HashMap<IdentityKey, HeadId>,

    // === Spatial Index (H3 → Head IDs) ===
    spatial_index: HashMap<CellIndex, HashSet<HeadId>>,
    resolution: Resolution,

    next_id: u64,
}

impl MarkerRegistry {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            heads: HashMap::new(),
            current: HashMap::new(),
            groups: HashMap::new(),
            trails: HashMap::new(),
            connectors: HashMap::new(),
            demoted: HashMap::new(),
            labels: HashMap::new(),
            spatial_index: HashMap::new(),
            resolution,
            next_id: 1,
        }
    }

    // ========================================================================
    // SPATIAL INDEX OPERATIONS
    // ========================================================================

    /// Convert WGS84 coordinates to an H3 sector.
    pub fn position_to_cell(&self, point: GeoPoint) -> Result<CellIndex, RegistryError> {
        let latlng = LatLng::new(point.lat, point.lng)
            .map_err(|e| RegistryError::InvalidCoordinates(format!("{:?}", e)))?;
        Ok(latlng.to_cell(self.resolution))
    }

    fn spatial_index_insert(&mut self, cell: CellIndex, id: HeadId) {
        self.spatial_index.entry(cell).or_default().insert(id);
    }

    fn spatial_index_remove(&mut self, cell: CellIndex, id: HeadId) {
        if let Some(set) = self.spatial_index.get_mut(&cell) {
            set.remove(&id);
            if set.is_empty() {
                self.spatial_index.remove(&cell);
            }
        }
    }

    /// Heads in a sector and its k-ring neighbors.
    pub fn spatial_query_kring(&self, cell: CellIndex, k: u32) -> HashSet<HeadId> {
        let mut result = HashSet::new();
        for neighbor_cell in cell.grid_disk_safe(k) {
            if let Some(ids) = self.spatial_index.get(&neighbor_cell) {
                result.extend(ids.iter().copied());
            }
        }
        result
    }

    /// Occupied sectors with their heads.
    pub fn sectors(&self) -> impl Iterator<Item = (CellIndex, &HashSet<HeadId>)> {
        self.spatial_index.iter().map(|(cell, ids)| (*cell, ids))
    }

    pub fn sector_stats(&self) -> SpatialIndexStats {
        let total_cells = self.spatial_index.len();
        let total_entries: usize = self.spatial_index.values().map(|s| s.len()).sum();
        let avg_per_cell = if total_cells > 0 {
            total_entries as f64 / total_cells as f64
        } else {
            0.0
        };

        SpatialIndexStats {
            total_cells,
            total_entries,
            avg_per_cell,
        }
    }

    // ========================================================================
    // HEAD LIFECYCLE
    // ========================================================================

    /// Registers a new head and makes it the identity's current one.
    pub fn insert_head(
        &mut self,
        report: &Report,
        placeholder: bool,
    ) -> Result<HeadId, RegistryError> {
        let identity = report.identity.ok_or(RegistryError::MissingIdentity)?;
        let position = report
            .position()
            .ok_or_else(|| RegistryError::InvalidCoordinates("missing position".to_string()))?;
        let sector = self.position_to_cell(position)?;

        let id = HeadId(self.next_id);
        self.next_id += 1;

        self.heads.insert(
            id,
            TrailHead {
                id,
                identity,
                object_id: report.object_id,
                report: report.clone(),
                position,
                display: DisplayClass::Head,
                classification: report.classification,
                placeholder,
                visible: true,
                has_direction: false,
                sector,
            },
        );
        self.current.insert(identity, id);
        self.groups.entry(report.object_id).or_default().push(id);
        self.spatial_index_insert(sector, id);
        Ok(id)
    }

    /// Swaps the report of an existing head, moving it between sectors if
    /// needed. Returns the (possibly new) sector.
    pub fn reposition(&mut self, id: HeadId, report: &Report) -> Result<CellIndex, RegistryError> {
        let position = report
            .position()
            .ok_or_else(|| RegistryError::InvalidCoordinates("missing position".to_string()))?;
        let new_cell = self.position_to_cell(position)?;
        let head = self.heads.get_mut(&id).ok_or(RegistryError::UnknownHead(id))?;

        let old_cell = head.sector;
        head.report = report.clone();
        head.position = position;
        head.classification = report.classification;
        head.sector = new_cell;

        if old_cell != new_cell {
            self.spatial_index_remove(old_cell, id);
            self.spatial_index_insert(new_cell, id);
        }
        Ok(new_cell)
    }

    /// Forgets a head entirely. The identity's current head falls back to
    /// its newest remaining one.
    pub fn remove_head(&mut self, id: HeadId) -> Option<TrailHead> {
        let head = self.heads.remove(&id)?;
        self.spatial_index_remove(head.sector, id);

        if let Some(group) = self.groups.get_mut(&head.object_id) {
            group.retain(|member| *member != id);
            if group.is_empty() {
                self.groups.remove(&head.object_id);
            }
        }
        if let Some(set) = self.demoted.get_mut(&head.identity) {
            set.remove(&id);
        }
        if self.labels.get(&head.identity) == Some(&id) {
            self.labels.remove(&head.identity);
        }

        if self.current.get(&head.identity) == Some(&id) {
            self.current.remove(&head.identity);
            let fallback = self
                .heads
                .values()
                .filter(|h| h.identity == head.identity)
                .map(|h| h.id)
                .max();
            if let Some(fallback) = fallback {
                self.current.insert(head.identity, fallback);
            }
        }
        Some(head)
    }

    pub fn head(&self, id: HeadId) -> Option<&TrailHead> {
        self.heads.get(&id)
    }

    pub fn head_mut(&mut self, id: HeadId) -> Option<&mut TrailHead> {
        self.heads.get_mut(&id)
    }

    pub fn heads(&self) -> impl Iterator<Item = &TrailHead> {
        self.heads.values()
    }

    pub fn current_head(&self, identity: IdentityKey) -> Option<&TrailHead> {
        self.current.get(&identity).and_then(|id| self.heads.get(id))
    }

    /// Every head ever created for an object, in creation order.
    pub fn group(&self, object: ObjectId) -> &[HeadId] {
        self.groups.get(&object).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn group_heads(&self, object: ObjectId) -> impl Iterator<Item = &TrailHead> {
        self.group(object).iter().filter_map(|id| self.heads.get(id))
    }

    /// Heads of an object currently drawn as `Head`.
    pub fn live_heads_for(&self, object: ObjectId) -> Vec<&TrailHead> {
        self.group_heads(object).filter(|h| h.is_live()).collect()
    }

    /// The object's newest live head, ties broken by creation order.
    pub fn latest_live_head(&self, object: ObjectId) -> Option<&TrailHead> {
        self.group_heads(object)
            .filter(|h| h.is_live())
            .max_by_key(|h| (h.timestamp(), h.id))
    }

    pub fn count_by_class(&self, class: DisplayClass) -> usize {
        self.heads.values().filter(|h| h.display == class).count()
    }

    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    // ========================================================================
    // TRAILS, DEMOTED SETS, LABELS
    // ========================================================================

    pub fn trail(&self, identity: IdentityKey) -> Option<&TrailGeometry> {
        self.trails.get(&identity)
    }

    pub fn trail_len(&self, identity: IdentityKey) -> usize {
        self.trails.get(&identity).map_or(0, TrailGeometry::len)
    }

    /// An identity whose trail holds at most one point.
    pub fn is_isolated(&self, identity: IdentityKey) -> bool {
        self.trail_len(identity) <= 1
    }

    /// Forgets the identity's trail geometry. Returns the removed length.
    pub fn clear_trail(&mut self, identity: IdentityKey) -> usize {
        self.trails.remove(&identity).map_or(0, |trail| trail.len())
    }

    /// Appends a point and returns the new trail length.
    pub fn extend_trail(&mut self, identity: IdentityKey, point: GeoPoint) -> usize {
        let trail = self.trails.entry(identity).or_default();
        trail.points.push(point);
        trail.len()
    }

    pub fn demoted(&self, identity: IdentityKey) -> Option<&BTreeSet<HeadId>> {
        self.demoted.get(&identity)
    }

    pub fn mark_demoted(&mut self, identity: IdentityKey, id: HeadId) {
        self.demoted.entry(identity).or_default().insert(id);
    }

    pub fn label(&self, identity: IdentityKey) -> Option<HeadId> {
        self.labels.get(&identity).copied()
    }

    pub fn set_label(&mut self, identity: IdentityKey, head: HeadId) {
        self.labels.insert(identity, head);
    }

    pub fn remove_label(&mut self, identity: IdentityKey) -> Option<HeadId> {
        self.labels.remove(&identity)
    }

    // ========================================================================
    // CONNECTORS
    // ========================================================================

    pub fn connector(&self, owner: IdentityKey) -> Option<&Connector> {
        self.connectors.get(&owner)
    }

    /// Stores a connector, returning the one it displaced.
    pub fn set_connector(&mut self, connector: Connector) -> Option<Connector> {
        self.connectors.insert(connector.owner, connector)
    }

    pub fn remove_connector(&mut self, owner: IdentityKey) -> Option<Connector> {
        self.connectors.remove(&owner)
    }

    /// Owners of connectors that end at `related`.
    pub fn inbound_connectors(&self, related: IdentityKey) -> Vec<IdentityKey> {
        let mut owners: Vec<IdentityKey> = self
            .connectors
            .values()
            .filter(|c| c.related == related)
            .map(|c| c.owner)
            .collect();
        owners.sort_by_key(|k| k.0);
        owners
    }

    /// True if a connector links the two identities in either direction.
    pub fn bridged(&self, a: IdentityKey, b: IdentityKey) -> bool {
        self.connectors.get(&a).is_some_and(|c| c.related == b)
            || self.connectors.get(&b).is_some_and(|c| c.related == a)
    }

    // ========================================================================
    // TRANSPLANT
    // ========================================================================

    /// Moves heads, trail, demoted set, label and owned connector from one
    /// identity key to another, and re-points connectors that ended at `from`.
    ///
    /// A destination that already has a trail or a current head keeps it.
    pub fn transplant(&mut self, from: IdentityKey, to: IdentityKey) {
        if from == to {
            return;
        }
        for head in self.heads.values_mut().filter(|h| h.identity == from) {
            head.identity = to;
        }
        if let Some(current) = self.current.remove(&from) {
            self.current.entry(to).or_insert(current);
        }
        if let Some(trail) = self.trails.remove(&from) {
            self.trails.entry(to).or_insert(trail);
        }
        if let Some(set) = self.demoted.remove(&from) {
            self.demoted.entry(to).or_default().extend(set);
        }
        if let Some(label) = self.labels.remove(&from) {
            self.labels.insert(to, label);
        }
        if let Some(mut connector) = self.connectors.remove(&from) {
            connector.owner = to;
            self.connectors.insert(to, connector);
        }
        for connector in self.connectors.values_mut() {
            if connector.related == from {
                connector.related = to;
            }
        }
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.heads.clear();
        self.current.clear();
        self.groups.clear();
        self.trails.clear();
        self.connectors.clear();
        self.demoted.clear();
        self.labels.clear();
        self.spatial_index.clear();
    }

    /// Structural invariants that must hold after every ingest.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let mut live_per_identity: HashMap<IdentityKey, usize> = HashMap::new();
        for head in self.heads.values().filter(|h| h.is_live()) {
            *live_per_identity.entry(head.identity).or_default() += 1;
        }
        for (identity, count) in live_per_identity {
            if count > 1 {
                violations.push(format!("{} has {} live heads", identity, count));
            }
        }

        for (owner, connector) in &self.connectors {
            if *owner != connector.owner {
                violations.push(format!(
                    "connector keyed by {} owned by {}",
                    owner, connector.owner
                ));
            }
        }

        for (identity, id) in &self.current {
            match self.heads.get(id) {
                Some(head) if head.identity == *identity => {}
                _ => violations.push(format!("{} points at foreign head {}", identity, id)),
            }
        }

        for (identity, set) in &self.demoted {
            for id in set {
                match self.heads.get(id) {
                    Some(head) if head.identity == *identity => {}
                    _ => violations.push(format!("{} has foreign demoted head {}", identity, id)),
                }
            }
        }

        violations
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Report has no identity")]
    MissingIdentity,

    #[error("Head not found: {0}")]
    UnknownHead(HeadId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(identity: u64, object: u64, ts: i64, lat: f64) -> Report {
        Report::new(IdentityKey(identity), ObjectId(object), ts, lat, 18.0).moving()
    }

    fn registry() -> MarkerRegistry {
        MarkerRegistry::new(Resolution::Five)
    }

    #[test]
    fn test_insert_tracks_current_and_group() {
        let mut reg = registry();
        let a1 = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        let a2 = reg.insert_head(&report(1, 7, 110, 59.01), false).unwrap();
        let b1 = reg.insert_head(&report(2, 7, 120, 59.02), false).unwrap();

        assert_eq!(reg.current_head(IdentityKey(1)).unwrap().id, a2);
        assert_eq!(reg.group(ObjectId(7)), &[a1, a2, b1]);
        assert_eq!(reg.latest_live_head(ObjectId(7)).unwrap().id, b1);
        assert_eq!(reg.sector_stats().total_entries, 3);
    }

    #[test]
    fn test_reposition_reindexes_sector() {
        let mut reg = registry();
        let id = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        let old = reg.head(id).unwrap().sector;

        let new = reg.reposition(id, &report(1, 7, 110, 45.0)).unwrap();
        assert_ne!(old, new);
        assert!(reg.spatial_query_kring(old, 0).is_empty());
        assert!(reg.spatial_query_kring(new, 1).contains(&id));
        assert_eq!(reg.sector_stats().total_cells, 1);
    }

    #[test]
    fn test_remove_falls_back_to_newest_remaining() {
        let mut reg = registry();
        let a1 = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        let a2 = reg.insert_head(&report(1, 7, 110, 59.0), true).unwrap();
        reg.set_label(IdentityKey(1), a2);

        let removed = reg.remove_head(a2).unwrap();
        assert!(removed.placeholder);
        assert_eq!(reg.current_head(IdentityKey(1)).unwrap().id, a1);
        assert!(reg.label(IdentityKey(1)).is_none());
        assert_eq!(reg.group(ObjectId(7)), &[a1]);
        assert!(reg.invariant_violations().is_empty());
    }

    #[test]
    fn test_transplant_rekeys_everything() {
        let mut reg = registry();
        let (a, b, c) = (IdentityKey(1), IdentityKey(2), IdentityKey(3));
        let p = GeoPoint::new(59.0, 18.0);
        let a1 = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();

        reg.extend_trail(a, p);
        reg.extend_trail(a, p);
        reg.mark_demoted(a, a1);
        reg.set_label(a, a1);
        reg.set_connector(Connector { owner: a, related: c, from: p, to: p, created_at: 100 });
        reg.set_connector(Connector { owner: c, related: a, from: p, to: p, created_at: 90 });

        reg.transplant(a, b);

        assert_eq!(reg.trail_len(b), 2);
        assert_eq!(reg.trail_len(a), 0);
        assert!(reg.demoted(b).unwrap().contains(&a1));
        assert_eq!(reg.label(b), Some(a1));
        assert_eq!(reg.connector(b).unwrap().related, c);
        assert_eq!(reg.connector(c).unwrap().related, b);
        assert!(reg.bridged(b, c));
        assert!(!reg.bridged(a, c));
        assert_eq!(reg.head(a1).unwrap().identity, b);
        assert_eq!(reg.current_head(b).unwrap().id, a1);
        assert!(reg.current_head(a).is_none());
        assert!(reg.invariant_violations().is_empty());
    }

    #[test]
    fn test_transplant_keeps_destination_current() {
        let mut reg = registry();
        let (a, b) = (IdentityKey(1), IdentityKey(2));
        let a1 = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        let b1 = reg.insert_head(&report(2, 7, 110, 59.1), false).unwrap();
        reg.mark_demoted(a, a1);

        reg.transplant(a, b);

        assert_eq!(reg.current_head(b).unwrap().id, b1);
        assert!(reg.current_head(a).is_none());
        assert!(reg.demoted(b).unwrap().contains(&a1));
    }

    #[test]
    fn test_invariant_flags_foreign_demoted_head() {
        let mut reg = registry();
        let a1 = reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        reg.mark_demoted(IdentityKey(2), a1);
        assert_eq!(reg.invariant_violations().len(), 1);
    }

    #[test]
    fn test_clear_trail_reports_length() {
        let mut reg = registry();
        let a = IdentityKey(1);
        reg.extend_trail(a, GeoPoint::new(59.0, 18.0));
        reg.extend_trail(a, GeoPoint::new(59.1, 18.0));
        assert_eq!(reg.clear_trail(a), 2);
        assert_eq!(reg.clear_trail(a), 0);
        assert!(reg.trail(a).is_none());
    }

    #[test]
    fn test_missing_position_refused() {
        let mut reg = registry();
        let mut bad = report(1, 7, 100, 59.0);
        bad.latitude = None;
        assert!(matches!(reg.insert_head(&bad, false), Err(RegistryError::InvalidCoordinates(_))));
        assert_eq!(reg.head_count(), 0);
    }

    #[test]
    fn test_invariant_flags_two_live_heads() {
        let mut reg = registry();
        reg.insert_head(&report(1, 7, 100, 59.0), false).unwrap();
        reg.insert_head(&report(1, 7, 110, 59.0), false).unwrap();
        assert_eq!(reg.invariant_violations().len(), 1);
    }
}
