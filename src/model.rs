use std::fmt;

use chrono::{DateTime, Utc};
use geo::{Coord, LineString, Point};
use serde::{Deserialize, Serialize};

pub type TripId = i32;
pub type PointId = i32;

/// Outcome of one pipeline stage as stored on the trip row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripStatus {
    Ok,
    Skipped,
    /// Routing failure, recorded verbatim
    Failed(String),
}

impl TripStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TripStatus::Ok => "OK",
            TripStatus::Skipped => "Skipped",
            TripStatus::Failed(reason) => reason,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TripStatus::Ok)
    }
}

impl From<&str> for TripStatus {
    fn from(value: &str) -> Self {
        match value {
            "OK" => TripStatus::Ok,
            "Skipped" => TripStatus::Skipped,
            other => TripStatus::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields of a submitted trip that the matching pipeline reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: TripId,
    pub match_status: Option<TripStatus>,
    pub fastest_status: Option<TripStatus>,
    pub match_distance: Option<f64>,
    pub fastest_distance: Option<f64>,
}

impl Trip {
    /// A freshly submitted trip that has never been through matching
    pub fn unmatched(id: TripId) -> Self {
        Self {
            id,
            match_status: None,
            fastest_status: None,
            match_distance: None,
            fastest_distance: None,
        }
    }

    /// Status pair used for logging and the batch tally
    pub fn status_label(&self) -> String {
        let label = |status: &Option<TripStatus>| {
            status
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "null".to_string())
        };
        format!(
            "{} -> {}",
            label(&self.match_status),
            label(&self.fastest_status)
        )
    }
}

/// One raw GPS sample recorded by the phone
#[derive(Debug, Clone, PartialEq)]
pub struct TripPoint {
    pub id: PointId,
    pub trip_id: TripId,
    pub geometry: Point<f64>,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    pub time: DateTime<Utc>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub moving: Option<bool>,
    pub activity: Option<i32>,
    pub confidence: Option<i32>,
}

impl TripPoint {
    pub fn new(
        id: PointId,
        trip_id: TripId,
        lon: f64,
        lat: f64,
        accuracy: f64,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trip_id,
            geometry: Point::new(lon, lat),
            accuracy,
            time,
            altitude: None,
            heading: None,
            speed: None,
            moving: None,
            activity: None,
            confidence: None,
        }
    }

    /// Unix timestamp in whole seconds, rounded from milliseconds
    pub fn unix_seconds(&self) -> i64 {
        (self.time.timestamp_millis() as f64 / 1000.0).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteType {
    Match,
    Fastest,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Match => "Match",
            RouteType::Fastest => "Fastest",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A matched or routed segment between two consecutive waypoints
#[derive(Debug, Clone, PartialEq)]
pub struct RouteLeg {
    /// Index of the routing solution the leg belongs to
    pub matching: usize,
    /// Index of the leg within its solution
    pub leg: usize,
    /// Meters
    pub distance: f64,
    /// Seconds
    pub duration: f64,
    /// Meters per second
    pub speed: f64,
    pub nodes: Vec<i64>,
    pub geometry: LineString<f64>,
    pub route_type: RouteType,
    pub trip_id: TripId,
    pub start_point_id: Option<PointId>,
    pub end_point_id: Option<PointId>,
    pub speed_outlier: bool,
}

/// The routing engine's snapped location for one input point
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTracepoint {
    pub geometry: Point<f64>,
    pub trip_id: TripId,
    pub point_id: Option<PointId>,
}

/// EWKT form understood by `ST_GeomFromEWKT`
pub fn point_ewkt(point: &Point<f64>) -> String {
    format!("SRID=4326;POINT({} {})", point.x(), point.y())
}

/// EWKT form understood by `ST_GeomFromEWKT`
pub fn linestring_ewkt(line: &LineString<f64>) -> String {
    let coords: Vec<String> = line
        .coords()
        .map(|c: &Coord<f64>| format!("{} {}", c.x, c.y))
        .collect();
    format!("SRID=4326;LINESTRING({})", coords.join(","))
}
