//! Persistence used by the matching pipeline. The schema itself is owned by
//! the trip submission service.

mod memory;
mod postgres;

use std::future::Future;

use anyhow::Result;

use crate::model::{RouteLeg, RouteTracepoint, Trip, TripId, TripPoint};

pub use memory::MemoryTripStore;
pub use postgres::PgTripStore;

/// Reads trips and points, writes match results back
pub trait TripStore: Send + Sync {
    /// Trips whose match status has never been set, by ascending id
    fn find_unmatched_trips(&self) -> impl Future<Output = Result<Vec<Trip>>> + Send;

    /// Matched trips whose fastest status has never been set, by ascending id
    fn find_trips_without_fastest(&self) -> impl Future<Output = Result<Vec<Trip>>> + Send;

    /// First and last stored tracepoints of a trip in insertion order. Empty
    /// when the trip has none; a single tracepoint is returned twice.
    fn get_endpoint_tracepoints(
        &self,
        trip_id: TripId,
    ) -> impl Future<Output = Result<Vec<RouteTracepoint>>> + Send;

    /// Raw points of a trip ordered by time
    fn get_points(&self, trip_id: TripId) -> impl Future<Output = Result<Vec<TripPoint>>> + Send;

    fn insert_legs(&self, legs: &[RouteLeg]) -> impl Future<Output = Result<()>> + Send;

    fn insert_tracepoints(
        &self,
        tracepoints: &[RouteTracepoint],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write back status and distance fields
    fn save_trip(&self, trip: &Trip) -> impl Future<Output = Result<()>> + Send;
}
