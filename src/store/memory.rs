use std::collections::{BTreeMap, HashSet};

use anyhow::{Result, bail};
use tokio::sync::Mutex;

use super::TripStore;
use crate::model::{RouteLeg, RouteTracepoint, Trip, TripId, TripPoint, TripStatus};

/// In-process store for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryTripStore {
    trips: Mutex<BTreeMap<TripId, Trip>>,
    points: Mutex<BTreeMap<TripId, Vec<TripPoint>>>,
    legs: Mutex<Vec<RouteLeg>>,
    tracepoints: Mutex<Vec<RouteTracepoint>>,
    failing_saves: Mutex<HashSet<TripId>>,
}

impl MemoryTripStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a trip together with its raw points
    pub async fn add_trip(&self, trip: Trip, points: Vec<TripPoint>) {
        self.points.lock().await.insert(trip.id, points);
        self.trips.lock().await.insert(trip.id, trip);
    }

    pub async fn trip(&self, trip_id: TripId) -> Option<Trip> {
        self.trips.lock().await.get(&trip_id).cloned()
    }

    /// Stored legs of a trip in insertion order
    pub async fn legs(&self, trip_id: TripId) -> Vec<RouteLeg> {
        self.legs
            .lock()
            .await
            .iter()
            .filter(|leg| leg.trip_id == trip_id)
            .cloned()
            .collect()
    }

    /// Stored tracepoints of a trip in insertion order
    pub async fn tracepoints(&self, trip_id: TripId) -> Vec<RouteTracepoint> {
        self.tracepoints
            .lock()
            .await
            .iter()
            .filter(|tp| tp.trip_id == trip_id)
            .cloned()
            .collect()
    }

    /// Record tracepoints as if an earlier match run had stored them
    pub async fn add_tracepoints(&self, tracepoints: Vec<RouteTracepoint>) {
        self.tracepoints.lock().await.extend(tracepoints);
    }

    /// Make every later `save_trip` for this trip fail
    pub async fn fail_saves_for(&self, trip_id: TripId) {
        self.failing_saves.lock().await.insert(trip_id);
    }
}

impl TripStore for MemoryTripStore {
    async fn find_unmatched_trips(&self) -> Result<Vec<Trip>> {
        Ok(self
            .trips
            .lock()
            .await
            .values()
            .filter(|trip| trip.match_status.is_none())
            .cloned()
            .collect())
    }

    async fn find_trips_without_fastest(&self) -> Result<Vec<Trip>> {
        Ok(self
            .trips
            .lock()
            .await
            .values()
            .filter(|trip| {
                trip.match_status == Some(TripStatus::Ok) && trip.fastest_status.is_none()
            })
            .cloned()
            .collect())
    }

    async fn get_endpoint_tracepoints(&self, trip_id: TripId) -> Result<Vec<RouteTracepoint>> {
        let tracepoints = self.tracepoints(trip_id).await;
        Ok(match (tracepoints.first(), tracepoints.last()) {
            (Some(first), Some(last)) => vec![first.clone(), last.clone()],
            _ => Vec::new(),
        })
    }

    async fn get_points(&self, trip_id: TripId) -> Result<Vec<TripPoint>> {
        let mut points = self
            .points
            .lock()
            .await
            .get(&trip_id)
            .cloned()
            .unwrap_or_default();
        points.sort_by_key(|p| p.time);
        Ok(points)
    }

    async fn insert_legs(&self, legs: &[RouteLeg]) -> Result<()> {
        self.legs.lock().await.extend_from_slice(legs);
        Ok(())
    }

    async fn insert_tracepoints(&self, tracepoints: &[RouteTracepoint]) -> Result<()> {
        self.tracepoints.lock().await.extend_from_slice(tracepoints);
        Ok(())
    }

    async fn save_trip(&self, trip: &Trip) -> Result<()> {
        if self.failing_saves.lock().await.contains(&trip.id) {
            bail!("Failed to save trip {}", trip.id);
        }
        self.trips.lock().await.insert(trip.id, trip.clone());
        Ok(())
    }
}
