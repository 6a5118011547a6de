//! Report model - one normalized position observation.
//!
//! Reports are closed, typed records. The branches the rejection filter and
//! the engine take on `classification` and `sequence_role` are exhaustive
//! matches on the enums below rather than string or integer comparisons.

use serde::{Deserialize, Serialize};

/// Stable handle grouping all Reports of one rendered track segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(pub u64);

/// The real-world station/device behind a succession of identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Station that transmitted the report (may differ from the object for
/// objects and items announced by another station).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(pub u64);

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id:{}", self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Returns the point quantized to `decimals` places, suitable as a
    /// hash/equality key.
    pub fn rounded(&self, decimals: u32) -> (i64, i64) {
        let scale = 10f64.powi(decimals as i32);
        ((self.lat * scale).round() as i64, (self.lng * scale).round() as i64)
    }
}

/// Server-side verdict attached to each report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Confirmed,
    UnconfirmedObject,
    Duplicate,
    OutOfOrder,
    Abnormal,
}

impl Classification {
    /// Decodes the wire code. Unknown codes are treated as abnormal.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Classification::Confirmed,
            2 => Classification::UnconfirmedObject,
            3 => Classification::Duplicate,
            4 => Classification::OutOfOrder,
            _ => Classification::Abnormal,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Classification::Confirmed => 1,
            Classification::UnconfirmedObject => 2,
            Classification::Duplicate => 3,
            Classification::OutOfOrder => 4,
            Classification::Abnormal => 5,
        }
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Classification::Confirmed)
    }
}

/// Position of a report inside a history burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceRole {
    /// First report of a bulk-loaded history
    Start,

    /// Any report between start and terminal
    Continuation,

    /// Last report of a burst, or a standalone live report
    Terminal,
}

impl SequenceRole {
    /// Decodes the wire code. Unknown codes are treated as terminal.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SequenceRole::Start,
            2 => SequenceRole::Continuation,
            _ => SequenceRole::Terminal,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            SequenceRole::Start => 1,
            SequenceRole::Continuation => 2,
            SequenceRole::Terminal => 3,
        }
    }
}

/// One inbound position/telemetry observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Track segment this report belongs to (None = malformed)
    pub identity: Option<IdentityKey>,

    pub object_id: ObjectId,
    pub sender_id: SenderId,

    /// Server-side packet id
    pub report_id: u64,

    /// Archive/source the report was replayed from; None for the upstream feed
    pub source_id: Option<u32>,

    /// Receive time (Unix seconds)
    pub timestamp: i64,

    /// Time the station claims in its own payload, if any (Unix seconds)
    pub reported_timestamp: Option<i64>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    /// Two-character symbol table + code
    pub symbol: Option<String>,

    /// Course over ground in degrees
    pub course: Option<f64>,

    pub is_moving: bool,
    pub classification: Classification,
    pub sequence_role: SequenceRole,

    /// Latest-only placeholder that full history will later overwrite
    pub is_overwrite: bool,

    /// Replayed history rather than live traffic
    pub is_historical: bool,
}

impl Report {
    /// Creates a confirmed, stationary, standalone live report.
    pub fn new(
        identity: IdentityKey,
        object_id: ObjectId,
        timestamp: i64,
        lat: f64,
        lng: f64,
    ) -> Self {
        Self {
            identity: Some(identity),
            object_id,
            sender_id: SenderId(object_id.0),
            report_id: 0,
            source_id: None,
            timestamp,
            reported_timestamp: None,
            latitude: Some(lat),
            longitude: Some(lng),
            symbol: None,
            course: None,
            is_moving: false,
            classification: Classification::Confirmed,
            sequence_role: SequenceRole::Terminal,
            is_overwrite: false,
            is_historical: false,
        }
    }

    pub fn moving(mut self) -> Self {
        self.is_moving = true;
        self
    }

    pub fn with_role(mut self, role: SequenceRole) -> Self {
        self.sequence_role = role;
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_report_id(mut self, report_id: u64) -> Self {
        self.report_id = report_id;
        self
    }

    pub fn with_source(mut self, source_id: u32) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_reported_timestamp(mut self, reported: i64) -> Self {
        self.reported_timestamp = Some(reported);
        self
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn with_course(mut self, course: f64) -> Self {
        self.course = Some(course);
        self
    }

    pub fn historical(mut self) -> Self {
        self.is_historical = true;
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.is_overwrite = true;
        self
    }

    /// Returns the position if both coordinates are present, finite and in
    /// range.
    pub fn position(&self) -> Option<GeoPoint> {
        let (lat, lng) = (self.latitude?, self.longitude?);
        if !lat.is_finite() || !lng.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return None;
        }
        Some(GeoPoint::new(lat, lng))
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.classification.is_confirmed()
    }

    #[inline]
    pub fn is_upstream(&self) -> bool {
        self.source_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_requires_both_coordinates() {
        let mut report = Report::new(IdentityKey(1), ObjectId(1), 100, 59.3, 18.0);
        assert!(report.position().is_some());

        report.longitude = None;
        assert!(report.position().is_none());
    }

    #[test]
    fn test_position_rejects_out_of_range() {
        let report = Report::new(IdentityKey(1), ObjectId(1), 100, 91.0, 18.0);
        assert!(report.position().is_none());

        let report = Report::new(IdentityKey(1), ObjectId(1), 100, f64::NAN, 18.0);
        assert!(report.position().is_none());
    }

    #[test]
    fn test_unknown_codes_fall_back() {
        assert_eq!(Classification::from_code(99), Classification::Abnormal);
        assert_eq!(SequenceRole::from_code(0), SequenceRole::Terminal);
        assert_eq!(SequenceRole::from_code(2), SequenceRole::Continuation);
    }

    #[test]
    fn test_rounded_position_key() {
        let a = GeoPoint::new(59.329_31, 18.068_58);
        let b = GeoPoint::new(59.329_34, 18.068_61);
        assert_eq!(a.rounded(4), b.rounded(4));
        assert_ne!(a.rounded(5), b.rounded(5));
    }
}
