//! Feed Oracle - seeded generator of station traffic.
//!
//! Stations wander around a fixed area and emit position reports at their
//! own interval. The oracle keeps the ground truth (which identity each
//! object currently reports under) and can inject the faults a real feed
//! produces: duplicates, late copies, identity rollover and unconfirmed
//! fixes.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trackview_core::{Classification, IdentityKey, ObjectId, Report, SequenceRole};

/// Centre of the simulated area (Stockholm archipelago)
const CENTER_LAT: f64 = 59.3;
const CENTER_LNG: f64 = 18.0;
const AREA_HALF_DEG: f64 = 0.5;

/// Fault injection rates, each applied per emitted report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Chance to follow a report with a copy carrying a later arrival time
    pub duplicate_rate: f64,

    /// Chance to follow a report with the station's previous report
    pub late_copy_rate: f64,

    /// Chance to flag a report as an unconfirmed object
    pub unconfirmed_rate: f64,

    /// Chance for the station to switch to a fresh identity before reporting
    pub rollover_rate: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            duplicate_rate: 0.0,
            late_copy_rate: 0.0,
            unconfirmed_rate: 0.0,
            rollover_rate: 0.0,
        }
    }
}

impl FeedConfig {
    /// Rates used by the storm scenario.
    pub fn chaotic() -> Self {
        Self {
            duplicate_rate: 0.10,
            late_copy_rate: 0.10,
            unconfirmed_rate: 0.05,
            rollover_rate: 0.02,
        }
    }
}

/// Ground truth for one simulated station.
#[derive(Debug, Clone)]
pub struct Station {
    pub object_id: ObjectId,
    pub identity: IdentityKey,
    pub lat: f64,
    pub lng: f64,

    /// Degrees clockwise from north
    pub heading: f64,

    /// Degrees per second
    pub speed: f64,

    pub moving: bool,
    pub symbol: String,

    /// Seconds between reports
    pub interval: i64,

    next_due: i64,
    next_report_id: u64,
    last_report: Option<Report>,
}

/// Deterministic traffic generator.
pub struct FeedOracle {
    rng: ChaCha8Rng,
    config: FeedConfig,
    stations: Vec<Station>,
    next_identity: u64,
    rollovers: HashMap<ObjectId, Vec<IdentityKey>>,
    emitted: u64,
    injected: u64,
}

impl FeedOracle {
    pub fn new(seed: u64, config: FeedConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
            stations: Vec::new(),
            next_identity: 1000,
            rollovers: HashMap::new(),
            emitted: 0,
            injected: 0,
        }
    }

    /// Adds a station that reports for the first time at `now`.
    pub fn spawn_station(&mut self, moving: bool, now: i64) -> ObjectId {
        let object_id = ObjectId(self.stations.len() as u64 + 1);
        let identity = self.allocate_identity();
        let lat = CENTER_LAT + self.rng.gen_range(-AREA_HALF_DEG..AREA_HALF_DEG);
        let lng = CENTER_LNG + self.rng.gen_range(-AREA_HALF_DEG..AREA_HALF_DEG);
        let heading = self.rng.gen_range(0.0..360.0);
        let speed = if moving { self.rng.gen_range(0.0001..0.001) } else { 0.0 };
        let symbol = if moving { "/>" } else { "/-" };
        let interval = self.rng.gen_range(5..30);

        self.stations.push(Station {
            object_id,
            identity,
            lat,
            lng,
            heading,
            speed,
            moving,
            symbol: symbol.to_string(),
            interval,
            next_due: now,
            next_report_id: 1,
            last_report: None,
        });
        self.rollovers.insert(object_id, vec![identity]);
        object_id
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, object: ObjectId) -> Option<&Station> {
        self.stations.iter().find(|s| s.object_id == object)
    }

    /// Identities an object has reported under, oldest first.
    pub fn identity_history(&self, object: ObjectId) -> &[IdentityKey] {
        self.rollovers.get(&object).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reports emitted as regular traffic.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Extra reports produced by fault injection.
    pub fn injected(&self) -> u64 {
        self.injected
    }

    /// Switches a station to a fresh identity.
    pub fn rollover(&mut self, object: ObjectId) -> Option<IdentityKey> {
        let identity = self.allocate_identity();
        let station = self.stations.iter_mut().find(|s| s.object_id == object)?;
        station.identity = identity;
        self.rollovers.entry(object).or_default().push(identity);
        Some(identity)
    }

    /// Advances every station to `now` and returns the reports that fell due,
    /// faults included.
    pub fn step(&mut self, now: i64, dt_secs: f64) -> Vec<Report> {
        let mut out = Vec::new();
        for index in 0..self.stations.len() {
            self.advance(index, dt_secs);
            if self.stations[index].next_due > now {
                continue;
            }

            if self.rng.gen_bool(self.config.rollover_rate) {
                let object = self.stations[index].object_id;
                self.rollover(object);
            }

            let mut report = self.report_for(index, now);
            if self.rng.gen_bool(self.config.unconfirmed_rate) {
                report = report.with_classification(Classification::UnconfirmedObject);
            }

            let previous = self.stations[index].last_report.replace(report.clone());
            self.stations[index].next_due = now + self.stations[index].interval;
            self.emitted += 1;
            out.push(report.clone());

            if self.rng.gen_bool(self.config.duplicate_rate) {
                out.push(Self::duplicate_of(&report, self.rng.gen_range(1..5)));
                self.injected += 1;
            }
            if let Some(previous) = previous {
                if self.rng.gen_bool(self.config.late_copy_rate) {
                    out.push(previous);
                    self.injected += 1;
                }
            }
        }
        out
    }

    /// Same fix delivered again after `delay` seconds.
    pub fn duplicate_of(report: &Report, delay: i64) -> Report {
        let mut copy = report.clone();
        copy.timestamp += delay;
        copy
    }

    /// A historical replay of `points` fixes ending at `until`, one minute
    /// apart, framed as a single sequence.
    pub fn history_burst(
        &mut self,
        object: ObjectId,
        points: usize,
        until: i64,
        source: u32,
    ) -> Vec<Report> {
        let Some(index) = self.stations.iter().position(|s| s.object_id == object) else {
            return Vec::new();
        };

        let station = &self.stations[index];
        let (lat, lng, identity) = (station.lat, station.lng, station.identity);
        let mut reports = Vec::with_capacity(points);
        for i in 0..points {
            let back = (points - 1 - i) as f64;
            let timestamp = until - (points - 1 - i) as i64 * 60;
            let role = match i {
                0 => SequenceRole::Start,
                n if n + 1 == points => SequenceRole::Terminal,
                _ => SequenceRole::Continuation,
            };
            let report = Report::new(identity, object, timestamp, lat - back * 0.001, lng)
                .moving()
                .historical()
                .with_role(role)
                .with_source(source)
                .with_report_id(i as u64 + 1)
                .with_reported_timestamp(timestamp);
            reports.push(report);
        }
        if let Some(only) = reports.first_mut().filter(|_| points == 1) {
            only.sequence_role = SequenceRole::Terminal;
        }
        reports
    }

    /// The latest-only answer for an object whose history has `points`
    /// fixes ending at `until`.
    pub fn placeholder_for(&self, object: ObjectId, points: usize, until: i64) -> Option<Report> {
        let station = self.station(object)?;
        Some(
            Report::new(station.identity, object, until, station.lat, station.lng)
                .moving()
                .overwrite()
                .with_report_id(points as u64)
                .with_reported_timestamp(until),
        )
    }

    fn allocate_identity(&mut self) -> IdentityKey {
        let identity = IdentityKey(self.next_identity);
        self.next_identity += 1;
        identity
    }

    fn advance(&mut self, index: usize, dt_secs: f64) {
        let station = &mut self.stations[index];
        if !station.moving {
            return;
        }
        let rad = station.heading.to_radians();
        station.lat += station.speed * rad.cos() * dt_secs;
        station.lng += station.speed * rad.sin() * dt_secs;

        // Bounce off the area edge
        if (station.lat - CENTER_LAT).abs() > AREA_HALF_DEG {
            station.heading = (180.0 - station.heading).rem_euclid(360.0);
            station.lat = station.lat.clamp(CENTER_LAT - AREA_HALF_DEG, CENTER_LAT + AREA_HALF_DEG);
        }
        if (station.lng - CENTER_LNG).abs() > AREA_HALF_DEG {
            station.heading = (360.0 - station.heading).rem_euclid(360.0);
            station.lng = station.lng.clamp(CENTER_LNG - AREA_HALF_DEG, CENTER_LNG + AREA_HALF_DEG);
        }
    }

    fn report_for(&mut self, index: usize, now: i64) -> Report {
        let station = &mut self.stations[index];
        let report_id = station.next_report_id;
        station.next_report_id += 1;

        let (lat, lng) = (station.lat, station.lng);
        let mut report = Report::new(station.identity, station.object_id, now, lat, lng)
            .with_symbol(&station.symbol)
            .with_report_id(report_id)
            .with_reported_timestamp(now);
        if station.moving {
            report = report.moving().with_course(station.heading);
        }
        report
    }
}
