//! Wire codec - inbound server messages and outbound request records.
//!
//! Inbound frames are a JSON envelope carrying a numeric `response_type`
//! and a type-specific `data` payload:
//!
//! | type | payload |
//! |------|---------|
//! | 1 | single report |
//! | 2 | batch of reports |
//! | 3 | filter-result batch |
//! | 4 | session status `{ "code": u8 }` |
//! | 5 | reset all state |
//! | 6 | server time echo `{ "server_time_ms", "client_time_ms" }` |
//!
//! Batch elements decode one by one. An element that does not decode is
//! skipped and counted; the rest of the batch is kept.
//!
//! Outbound requests are JSON records tagged by `request_kind`. Their
//! `serde_json` serialization is the canonical form the session compares
//! when suppressing repeated viewport requests.

use crate::report::{Classification, IdentityKey, ObjectId, Report, SenderId, SequenceRole};
use serde::{Deserialize, Serialize};

const RESPONSE_REPORT: u8 = 1;
const RESPONSE_BATCH: u8 = 2;
const RESPONSE_FILTER_BATCH: u8 = 3;
const RESPONSE_STATUS: u8 = 4;
const RESPONSE_RESET: u8 = 5;
const RESPONSE_TIME_ECHO: u8 = 6;

// ============================================================================
// INBOUND
// ============================================================================

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Report(Report),
    Batch(Vec<Report>),
    FilterBatch(Vec<Report>),
    Status(u8),
    Reset,
    TimeEcho {
        server_time_ms: i64,
        client_time_ms: Option<i64>,
    },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub message: InboundMessage,

    /// Batch elements dropped because they did not decode
    pub skipped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    response_type: u8,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusPayload {
    code: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimeEchoPayload {
    server_time_ms: i64,
    #[serde(default)]
    client_time_ms: Option<i64>,
}

/// Report as it travels on the wire. Codes stay numeric here and are
/// mapped onto the closed enums in [`Report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireReport {
    #[serde(default)]
    pub identity_id: Option<u64>,
    pub object_id: u64,
    #[serde(default)]
    pub sender_id: Option<u64>,
    #[serde(default)]
    pub report_id: u64,
    #[serde(default)]
    pub source_id: Option<u32>,
    pub timestamp: i64,
    #[serde(default)]
    pub reported_timestamp: Option<i64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub course: Option<f64>,
    #[serde(default)]
    pub is_moving: bool,
    #[serde(default)]
    pub classification: u8,
    #[serde(default)]
    pub sequence_role: u8,
    #[serde(default)]
    pub is_overwrite: bool,
    #[serde(default)]
    pub is_historical: bool,
}

impl From<WireReport> for Report {
    fn from(wire: WireReport) -> Self {
        Report {
            identity: wire.identity_id.map(IdentityKey),
            object_id: ObjectId(wire.object_id),
            sender_id: SenderId(wire.sender_id.unwrap_or(wire.object_id)),
            report_id: wire.report_id,
            source_id: wire.source_id,
            timestamp: wire.timestamp,
            reported_timestamp: wire.reported_timestamp,
            latitude: wire.latitude,
            longitude: wire.longitude,
            symbol: wire.symbol,
            course: wire.course,
            is_moving: wire.is_moving,
            classification: Classification::from_code(wire.classification),
            sequence_role: SequenceRole::from_code(wire.sequence_role),
            is_overwrite: wire.is_overwrite,
            is_historical: wire.is_historical,
        }
    }
}

impl From<&Report> for WireReport {
    fn from(report: &Report) -> Self {
        WireReport {
            identity_id: report.identity.map(|k| k.0),
            object_id: report.object_id.0,
            sender_id: Some(report.sender_id.0),
            report_id: report.report_id,
            source_id: report.source_id,
            timestamp: report.timestamp,
            reported_timestamp: report.reported_timestamp,
            latitude: report.latitude,
            longitude: report.longitude,
            symbol: report.symbol.clone(),
            course: report.course,
            is_moving: report.is_moving,
            classification: report.classification.code(),
            sequence_role: report.sequence_role.code(),
            is_overwrite: report.is_overwrite,
            is_historical: report.is_historical,
        }
    }
}

/// Decodes one inbound text frame.
pub fn decode(text: &str) -> Result<DecodedFrame, WireError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    let mut skipped = 0;
    let message = match envelope.response_type {
        RESPONSE_REPORT => {
            let wire: WireReport = serde_json::from_value(envelope.data)?;
            InboundMessage::Report(wire.into())
        }
        RESPONSE_BATCH => {
            let (reports, bad) = decode_batch(envelope.data)?;
            skipped = bad;
            InboundMessage::Batch(reports)
        }
        RESPONSE_FILTER_BATCH => {
            let (reports, bad) = decode_batch(envelope.data)?;
            skipped = bad;
            InboundMessage::FilterBatch(reports)
        }
        RESPONSE_STATUS => {
            let status: StatusPayload = serde_json::from_value(envelope.data)?;
            InboundMessage::Status(status.code)
        }
        RESPONSE_RESET => InboundMessage::Reset,
        RESPONSE_TIME_ECHO => {
            let echo: TimeEchoPayload = serde_json::from_value(envelope.data)?;
            InboundMessage::TimeEcho {
                server_time_ms: echo.server_time_ms,
                client_time_ms: echo.client_time_ms,
            }
        }
        other => return Err(WireError::UnknownResponseType(other)),
    };

    Ok(DecodedFrame { message, skipped })
}

/// Returns the decoded reports and the number of elements skipped.
fn decode_batch(data: serde_json::Value) -> Result<(Vec<Report>, usize), WireError> {
    let items: Vec<serde_json::Value> = serde_json::from_value(data)?;
    let total = items.len();
    let reports: Vec<Report> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<WireReport>(item).ok())
        .map(Report::from)
        .collect();
    let skipped = total - reports.len();
    Ok((reports, skipped))
}

/// Encodes an inbound message the way the server frames it.
///
/// The client never sends these; the simulation harness and tests use it to
/// script a server.
pub fn encode_inbound(message: &InboundMessage) -> Result<String, WireError> {
    let (response_type, data) = match message {
        InboundMessage::Report(report) => {
            (RESPONSE_REPORT, serde_json::to_value(WireReport::from(report))?)
        }
        InboundMessage::Batch(reports) => (RESPONSE_BATCH, encode_batch(reports)?),
        InboundMessage::FilterBatch(reports) => (RESPONSE_FILTER_BATCH, encode_batch(reports)?),
        InboundMessage::Status(code) => {
            (RESPONSE_STATUS, serde_json::to_value(StatusPayload { code: *code })?)
        }
        InboundMessage::Reset => (RESPONSE_RESET, serde_json::Value::Null),
        InboundMessage::TimeEcho { server_time_ms, client_time_ms } => (
            RESPONSE_TIME_ECHO,
            serde_json::to_value(TimeEchoPayload {
                server_time_ms: *server_time_ms,
                client_time_ms: *client_time_ms,
            })?,
        ),
    };

    Ok(serde_json::to_string(&Envelope { response_type, data })?)
}

fn encode_batch(reports: &[Report]) -> Result<serde_json::Value, WireError> {
    let wires: Vec<WireReport> = reports.iter().map(WireReport::from).collect();
    Ok(serde_json::to_value(wires)?)
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub east: f64,
    pub south: f64,
    pub west: f64,
}

impl BoundingBox {
    pub fn new(north: f64, east: f64, south: f64, west: f64) -> Self {
        Self { north, east, south, west }
    }

    /// True if the point lies inside the box. A box whose west edge is east
    /// of its east edge wraps the antimeridian.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        if lat < self.south || lat > self.north {
            return false;
        }
        if self.west <= self.east {
            lng >= self.west && lng <= self.east
        } else {
            lng >= self.west || lng <= self.east
        }
    }

    /// Returns the box grown by `margin` degrees on every side.
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            north: (self.north + margin).min(90.0),
            south: (self.south - margin).max(-90.0),
            east: self.east + margin,
            west: self.west - margin,
        }
    }

    /// Bit-exact fingerprint, usable as a hash key.
    pub fn fingerprint(&self) -> [u64; 4] {
        [
            self.north.to_bits(),
            self.east.to_bits(),
            self.south.to_bits(),
            self.west.to_bits(),
        ]
    }
}

/// Viewport/position request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRequest {
    pub bounds: BoundingBox,

    /// Minutes of history to replay for stations in view
    pub history_minutes: u32,

    /// Replay the map as of this Unix time instead of "now"
    #[serde(default)]
    pub reference_time: Option<i64>,

    /// Only the latest report per station (placeholders)
    #[serde(default)]
    pub latest_only: bool,

    /// Lightweight heartbeat variant of an earlier request
    #[serde(default)]
    pub refresh: bool,
}

impl PositionRequest {
    pub fn new(bounds: BoundingBox, history_minutes: u32) -> Self {
        Self {
            bounds,
            history_minutes,
            reference_time: None,
            latest_only: false,
            refresh: false,
        }
    }

    /// Returns the heartbeat variant of this request.
    pub fn refresh_variant(&self) -> Self {
        Self {
            refresh: true,
            ..self.clone()
        }
    }
}

/// Every request kind the client can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_kind", rename_all = "snake_case")]
pub enum OutboundRequest {
    Position(PositionRequest),
    FilterIds { ids: Vec<u64> },
    FilterNames { names: Vec<String> },
    History { object_id: u64 },
    StopFilter,
}

impl OutboundRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundRequest::Position(request) if request.refresh => "position_refresh",
            OutboundRequest::Position(_) => "position",
            OutboundRequest::FilterIds { .. } => "filter_ids",
            OutboundRequest::FilterNames { .. } => "filter_names",
            OutboundRequest::History { .. } => "history",
            OutboundRequest::StopFilter => "stop_filter",
        }
    }

    /// Canonical string form.
    pub fn canonical(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that can occur while decoding or encoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown response type: {0}")]
    UnknownResponseType(u8),
}

// ============================================================================
// TESTS
// ============================================================================
