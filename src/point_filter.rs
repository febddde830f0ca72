use chrono::Duration;
use geo::{Bearing, Distance, Haversine};
use log::debug;

use crate::model::TripPoint;

/// Thresholds for GPS trace simplification
#[derive(Debug, Clone)]
pub struct PointFilterConfig {
    /// Interior points turning less than this many degrees are dropped
    pub min_turn_angle: f64,
    /// Minimum time since the last kept point
    pub min_interval: Duration,
    /// Minimum distance from the last kept point (meters)
    pub min_distance: f64,
}

impl Default for PointFilterConfig {
    fn default() -> Self {
        Self {
            min_turn_angle: 90.0,
            min_interval: Duration::seconds(10),
            min_distance: 100.0,
        }
    }
}

/// Simplify a time-ordered trace. The first and last points always survive.
///
/// Both passes repeat until neither removes a point, so filtering the output
/// again leaves it unchanged.
pub fn filter_points(points: &[TripPoint], config: &PointFilterConfig) -> Vec<TripPoint> {
    let mut filtered = points.to_vec();
    loop {
        let before = filtered.len();
        filtered = drop_clustered_points(drop_straight_points(filtered, config), config);
        if filtered.len() == before {
            break;
        }
    }
    debug!(
        "Filtered trace from {} to {} points",
        points.len(),
        filtered.len()
    );
    filtered
}

/// Absolute heading change at `current`, reduced to [0, 180]
pub fn turn_angle(previous: &TripPoint, current: &TripPoint, next: &TripPoint) -> f64 {
    let heading_in = Haversine.bearing(previous.geometry, current.geometry);
    let heading_out = Haversine.bearing(current.geometry, next.geometry);
    let angle = (heading_out - heading_in).abs();
    angle.min(360.0 - angle)
}

// The incoming heading is measured from the last kept point.
fn drop_straight_points(points: Vec<TripPoint>, config: &PointFilterConfig) -> Vec<TripPoint> {
    let last = points.len().saturating_sub(1);
    let mut kept: Vec<TripPoint> = Vec::with_capacity(points.len());

    for (i, point) in points.iter().enumerate() {
        if let Some(previous) = kept.last() {
            if i != last && turn_angle(previous, point, &points[i + 1]) < config.min_turn_angle {
                continue;
            }
        }
        kept.push(point.clone());
    }

    kept
}

fn drop_clustered_points(points: Vec<TripPoint>, config: &PointFilterConfig) -> Vec<TripPoint> {
    let last = points.len().saturating_sub(1);
    let mut kept: Vec<TripPoint> = Vec::with_capacity(points.len());

    for (i, point) in points.into_iter().enumerate() {
        if let Some(latest) = kept.last() {
            if i != last {
                let too_soon = point.time - latest.time < config.min_interval;
                let too_close =
                    Haversine.distance(point.geometry, latest.geometry) < config.min_distance;
                if too_soon && too_close {
                    continue;
                }
            }
        }
        kept.push(point);
    }

    kept
}
