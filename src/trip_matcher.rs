use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use crate::model::{RouteTracepoint, RouteType, Trip, TripId, TripPoint, TripStatus};
use crate::osrm::{EngineConnector, Service};
use crate::outliers::mark_speed_outliers;
use crate::point_filter::{PointFilterConfig, filter_points};
use crate::routing::{RouteQuery, RouteResult, RoutingClient, RoutingError};
use crate::store::TripStore;

/// Batch settings for matching and alternative routing
#[derive(Debug, Clone)]
pub struct TripMatcherConfig {
    /// Trip pipelines allowed in flight at once
    pub concurrency: usize,
    /// Filtered traces with this many points or fewer are not matched
    pub min_points: usize,
    /// Added to each point's accuracy to form the match search radius
    pub radius_padding: f64,
    pub filter: PointFilterConfig,
    /// Draw a progress bar on stderr while a batch runs
    pub show_progress: bool,
}

impl Default for TripMatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            min_points: 5,
            radius_padding: 6.0,
            filter: PointFilterConfig::default(),
            show_progress: false,
        }
    }
}

/// Outcome of one matching run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Trips per `"{match} -> {fastest}"` status pair
    pub statuses: BTreeMap<String, usize>,
    /// Trips whose points or results could not be read or written
    pub failures: Vec<(TripId, String)>,
}

impl BatchReport {
    fn record(&mut self, status: String) {
        *self.statuses.entry(status).or_insert(0) += 1;
    }

    /// Trips that reached a status, failures excluded
    pub fn processed(&self) -> usize {
        self.statuses.values().sum()
    }

    /// True when every trip's results were read and written
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives every unmatched trip through filter, match, fastest route and
/// persistence.
pub struct TripMatcher<S: TripStore, C: EngineConnector> {
    store: Arc<S>,
    routing: RoutingClient<C>,
    config: TripMatcherConfig,
}

impl<S: TripStore, C: EngineConnector> TripMatcher<S, C> {
    /// Wrap a store and a routing client; nothing is loaded until a run starts
    pub fn new(store: Arc<S>, routing: RoutingClient<C>, config: TripMatcherConfig) -> Self {
        Self {
            store,
            routing,
            config,
        }
    }

    /// Match all trips whose match status is unset
    pub async fn match_all(&self) -> Result<BatchReport> {
        let trips = self
            .store
            .find_unmatched_trips()
            .await
            .context("Failed to load unmatched trips")?;
        info!("Matching {} trips...", trips.len());

        let report = self
            .run_batch(trips, "Matching trips", move |trip| async move {
                self.process_trip(trip).await.map(|trip| trip.status_label())
            })
            .await?;

        info!("Matching complete.");
        self.log_report(&report);
        Ok(report)
    }

    /// Route matched trips that never got a fastest route. Trips are tallied
    /// by fastest status; a routing failure leaves the status unset so the
    /// trip is picked up again on the next run.
    pub async fn find_alternatives(&self) -> Result<BatchReport> {
        let trips = self
            .store
            .find_trips_without_fastest()
            .await
            .context("Failed to load trips without a fastest route")?;
        info!("Finding alternatives for {} trips...", trips.len());

        let report = self
            .run_batch(trips, "Finding alternatives", move |trip| async move {
                self.backfill_fastest(trip).await
            })
            .await?;

        info!("Alternatives complete.");
        self.log_report(&report);
        Ok(report)
    }

    /// Run `job` over every trip with bounded concurrency. `job` returns the
    /// status the trip is tallied under; its errors are collected as failures.
    async fn run_batch<F, Fut>(
        &self,
        trips: Vec<Trip>,
        message: &'static str,
        job: F,
    ) -> Result<BatchReport>
    where
        F: Fn(Trip) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let progress = if self.config.show_progress {
            Some(progress_bar(trips.len() as u64, message)?)
        } else {
            None
        };

        let outcomes: Vec<(TripId, Result<String>)> = stream::iter(trips)
            .map(|trip| {
                let progress = progress.as_ref();
                let trip_id = trip.id;
                let outcome = job(trip);
                async move {
                    let outcome = outcome.await;
                    if let Some(pb) = progress {
                        pb.inc(1);
                    }
                    (trip_id, outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        let mut report = BatchReport::default();
        for (trip_id, outcome) in outcomes {
            match outcome {
                Ok(status) => report.record(status),
                Err(e) => {
                    error!("{}: {:#}", trip_id, e);
                    report.failures.push((trip_id, format!("{:#}", e)));
                }
            }
        }
        Ok(report)
    }

    fn log_report(&self, report: &BatchReport) {
        for (status, count) in &report.statuses {
            info!("{}: {}", status, count);
        }
        let restarts = self.routing.worker_restarts();
        if restarts > 0 {
            warn!("Routing worker was replaced {} times", restarts);
        }
    }

    /// Run one trip through the pipeline and persist the results. Routing
    /// failures end up in the trip's status fields; only storage errors are
    /// returned.
    pub async fn process_trip(&self, mut trip: Trip) -> Result<Trip> {
        let raw = self.store.get_points(trip.id).await?;
        let points = filter_points(&raw, &self.config.filter);

        let (matched, fastest) = if points.len() <= self.config.min_points {
            trip.match_status = Some(TripStatus::Skipped);
            trip.match_distance = Some(0.0);
            trip.fastest_status = Some(TripStatus::Skipped);
            trip.fastest_distance = Some(0.0);
            (RouteResult::default(), RouteResult::default())
        } else {
            let (match_status, matched) = settle(self.match_trace(trip.id, &points).await);
            trip.match_distance = Some(total_distance(&matched));

            let (fastest_status, fastest) = match fastest_query(trip.id, &matched.tracepoints) {
                Some(query) if match_status.is_ok() => {
                    settle(self.routing.run(Service::Route, &query).await)
                }
                _ => (TripStatus::Skipped, RouteResult::default()),
            };
            trip.fastest_distance = Some(total_distance(&fastest));

            trip.match_status = Some(match_status);
            trip.fastest_status = Some(fastest_status);
            (matched, fastest)
        };

        info!("{}: {}", trip.id, trip.status_label());
        self.save_results(&trip, matched, fastest).await?;
        Ok(trip)
    }

    /// Route between the first and last stored tracepoints of a matched trip
    async fn backfill_fastest(&self, mut trip: Trip) -> Result<String> {
        let endpoints = self.store.get_endpoint_tracepoints(trip.id).await?;

        let Some(query) = fastest_query(trip.id, &endpoints) else {
            // Nothing was snapped, so there is nothing to route between
            trip.fastest_status = Some(TripStatus::Skipped);
            trip.fastest_distance = Some(0.0);
            info!("{}: {}", trip.id, TripStatus::Skipped);
            self.store.save_trip(&trip).await?;
            return Ok(TripStatus::Skipped.to_string());
        };

        let fastest = match self.routing.run(Service::Route, &query).await {
            Ok(fastest) => fastest,
            Err(e) => {
                warn!("{}: {}", trip.id, e);
                return Ok(e.to_string());
            }
        };

        trip.fastest_status = Some(TripStatus::Ok);
        trip.fastest_distance = Some(total_distance(&fastest));
        info!("{}: {}", trip.id, TripStatus::Ok);

        let (legs_inserted, saved) = tokio::join!(
            self.store.insert_legs(&fastest.legs),
            self.store.save_trip(&trip),
        );
        legs_inserted?;
        saved?;
        Ok(TripStatus::Ok.to_string())
    }

    async fn match_trace(
        &self,
        trip_id: TripId,
        points: &[TripPoint],
    ) -> Result<RouteResult, RoutingError> {
        let query = RouteQuery {
            coordinates: points.iter().map(|p| p.geometry).collect(),
            radiuses: points
                .iter()
                .map(|p| p.accuracy + self.config.radius_padding)
                .collect(),
            timestamps: points.iter().map(TripPoint::unix_seconds).collect(),
            route_type: RouteType::Match,
            trip_id,
            point_ids: points.iter().map(|p| Some(p.id)).collect(),
        };

        let mut result = self.routing.run(Service::Match, &query).await?;
        mark_speed_outliers(&mut result.legs);
        Ok(result)
    }

    async fn save_results(&self, trip: &Trip, matched: RouteResult, fastest: RouteResult) -> Result<()> {
        let mut legs = matched.legs;
        legs.extend(fastest.legs);

        let (legs_inserted, tracepoints_inserted, saved) = tokio::join!(
            self.store.insert_legs(&legs),
            self.store.insert_tracepoints(&matched.tracepoints),
            self.store.save_trip(trip),
        );
        legs_inserted?;
        tracepoints_inserted?;
        saved?;
        Ok(())
    }

    /// Drain queued routing work and stop the routing worker
    pub async fn shutdown(self) {
        self.routing.shutdown().await;
    }
}

fn settle(outcome: Result<RouteResult, RoutingError>) -> (TripStatus, RouteResult) {
    match outcome {
        Ok(result) => (TripStatus::Ok, result),
        Err(e) => (TripStatus::Failed(e.to_string()), RouteResult::default()),
    }
}

fn total_distance(result: &RouteResult) -> f64 {
    result.legs.iter().map(|leg| leg.distance).sum()
}

/// Route between the first and last snapped points of a match
fn fastest_query(trip_id: TripId, tracepoints: &[RouteTracepoint]) -> Option<RouteQuery> {
    let first = tracepoints.first()?;
    let last = tracepoints.last()?;
    Some(RouteQuery {
        coordinates: vec![first.geometry, last.geometry],
        radiuses: Vec::new(),
        timestamps: Vec::new(),
        route_type: RouteType::Fastest,
        trip_id,
        point_ids: vec![first.point_id, last.point_id],
    })
}

fn progress_bar(len: u64, message: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) - {msg}")?
            .progress_chars("##-"),
    );
    pb.set_message(message);
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osrm::{EngineResponse, Solution};
    use crate::point_filter::tests::zigzag;
    use crate::routing::RoutingConfig;
    use crate::routing::tests::{Scripted, ScriptedConnector, leg, waypoint};
    use crate::store::MemoryTripStore;
    use std::time::Duration;

    fn trace(trip_id: TripId, count: usize) -> Vec<TripPoint> {
        zigzag(count)
            .into_iter()
            .map(|mut p| {
                p.trip_id = trip_id;
                p
            })
            .collect()
    }

    /// One matching over every input point; 100 m legs
    fn matched(points: &[TripPoint]) -> EngineResponse {
        EngineResponse {
            code: "Ok".into(),
            matchings: vec![Solution {
                legs: points
                    .windows(2)
                    .map(|w| {
                        let (a, b) = (w[0].geometry, w[1].geometry);
                        leg(100.0, 25.0, vec![vec![[a.x(), a.y()], [b.x(), b.y()]]])
                    })
                    .collect(),
                ..Default::default()
            }],
            tracepoints: points
                .iter()
                .map(|p| waypoint(p.geometry.x(), p.geometry.y(), 0))
                .collect(),
            ..Default::default()
        }
    }

    fn fastest() -> EngineResponse {
        EngineResponse {
            code: "Ok".into(),
            routes: vec![Solution {
                legs: vec![leg(450.0, 90.0, vec![vec![[0.0, 0.0], [1.0, 1.0]]])],
                ..Default::default()
            }],
            waypoints: vec![waypoint(0.0, 0.0, 0), waypoint(1.0, 1.0, 0)],
            ..Default::default()
        }
    }

    fn matcher(
        store: Arc<MemoryTripStore>,
        connector: ScriptedConnector,
        concurrency: usize,
    ) -> TripMatcher<MemoryTripStore, ScriptedConnector> {
        let routing = RoutingClient::new(
            connector,
            RoutingConfig {
                network: "champaign".into(),
                timeout: Duration::from_millis(100),
            },
        );
        let config = TripMatcherConfig {
            concurrency,
            ..Default::default()
        };
        TripMatcher::new(store, routing, config)
    }

    #[tokio::test]
    async fn test_sparse_trace_is_skipped_without_routing() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(Trip::unmatched(1), trace(1, 5)).await;
        let connector = ScriptedConnector::default();

        let report = matcher(store.clone(), connector.clone(), 10)
            .match_all()
            .await
            .unwrap();

        let trip = store.trip(1).await.unwrap();
        assert_eq!(trip.match_status, Some(TripStatus::Skipped));
        assert_eq!(trip.fastest_status, Some(TripStatus::Skipped));
        assert_eq!(trip.match_distance, Some(0.0));
        assert_eq!(connector.engine.calls(), 0);
        assert!(store.legs(1).await.is_empty());
        assert_eq!(report.statuses.get("Skipped -> Skipped"), Some(&1));
    }

    #[tokio::test]
    async fn test_match_and_fastest_are_persisted() {
        let store = Arc::new(MemoryTripStore::new());
        let points = trace(1, 8);
        store.add_trip(Trip::unmatched(1), points.clone()).await;
        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Reply(matched(&points)));
        connector.engine.script(Scripted::Reply(fastest()));

        let report = matcher(store.clone(), connector.clone(), 10)
            .match_all()
            .await
            .unwrap();
        assert!(report.is_clean());

        let trip = store.trip(1).await.unwrap();
        assert_eq!(trip.status_label(), "OK -> OK");
        assert_eq!(trip.match_distance, Some(700.0));
        assert_eq!(trip.fastest_distance, Some(450.0));

        let legs = store.legs(1).await;
        assert_eq!(legs.len(), 8);
        assert!(legs[..7].iter().all(|l| l.route_type == RouteType::Match));
        assert_eq!(legs[7].route_type, RouteType::Fastest);
        // 30 s between consecutive samples
        assert_eq!(legs[0].duration, 30.0);
        assert_eq!(legs[7].start_point_id, Some(0));
        assert_eq!(legs[7].end_point_id, Some(7));
        assert_eq!(store.tracepoints(1).await.len(), 8);
        assert_eq!(connector.engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_fastest_timeout_keeps_match_results() {
        let store = Arc::new(MemoryTripStore::new());
        let points = trace(1, 8);
        store.add_trip(Trip::unmatched(1), points.clone()).await;
        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Reply(matched(&points)));
        connector.engine.script(Scripted::Hang);

        matcher(store.clone(), connector, 10).match_all().await.unwrap();

        let trip = store.trip(1).await.unwrap();
        assert_eq!(trip.match_status, Some(TripStatus::Ok));
        assert_eq!(
            trip.fastest_status,
            Some(TripStatus::Failed("Timeout".into()))
        );
        assert_eq!(trip.fastest_distance, Some(0.0));
        let legs = store.legs(1).await;
        assert_eq!(legs.len(), 7);
        assert!(legs.iter().all(|l| l.route_type == RouteType::Match));
        assert_eq!(store.tracepoints(1).await.len(), 8);
    }

    #[tokio::test]
    async fn test_match_refusal_skips_fastest() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(Trip::unmatched(1), trace(1, 8)).await;
        let connector = ScriptedConnector::default();
        connector
            .engine
            .script(Scripted::Refuse("Could not match the trace.".into()));

        matcher(store.clone(), connector.clone(), 10)
            .match_all()
            .await
            .unwrap();

        let trip = store.trip(1).await.unwrap();
        assert_eq!(trip.status_label(), "Could not match the trace. -> Skipped");
        assert_eq!(trip.match_distance, Some(0.0));
        assert!(store.legs(1).await.is_empty());
        assert!(store.tracepoints(1).await.is_empty());
        assert_eq!(connector.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_speed_outliers_are_marked_on_match_legs() {
        let store = Arc::new(MemoryTripStore::new());
        let points = trace(1, 8);
        store.add_trip(Trip::unmatched(1), points.clone()).await;
        let mut response = matched(&points);
        // 600 m in 30 s is 20 m/s
        response.matchings[0].legs[3].distance = 600.0;
        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Reply(response));
        connector.engine.script(Scripted::Reply(fastest()));

        matcher(store.clone(), connector, 10).match_all().await.unwrap();

        let flagged: Vec<usize> = store
            .legs(1)
            .await
            .iter()
            .filter(|l| l.speed_outlier)
            .map(|l| l.leg)
            .collect();
        assert_eq!(flagged, vec![3]);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_isolated() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(Trip::unmatched(1), trace(1, 3)).await;
        store.add_trip(Trip::unmatched(2), trace(2, 3)).await;
        store.fail_saves_for(1).await;

        let report = matcher(store.clone(), ScriptedConnector::default(), 10)
            .match_all()
            .await
            .unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 1);
        assert!(report.failures[0].1.contains("Failed to save trip 1"));
        assert_eq!(report.processed(), 1);
        assert_eq!(
            store.trip(2).await.unwrap().match_status,
            Some(TripStatus::Skipped)
        );
        assert_eq!(store.trip(1).await.unwrap().match_status, None);
    }

    #[tokio::test]
    async fn test_batch_tally() {
        let store = Arc::new(MemoryTripStore::new());
        let long = trace(2, 8);
        store.add_trip(Trip::unmatched(1), trace(1, 4)).await;
        store.add_trip(Trip::unmatched(2), long.clone()).await;
        store.add_trip(Trip::unmatched(3), trace(3, 8)).await;
        let mut done = Trip::unmatched(4);
        done.match_status = Some(TripStatus::Ok);
        store.add_trip(done, trace(4, 8)).await;

        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Reply(matched(&long)));
        connector.engine.script(Scripted::Reply(fastest()));
        connector.engine.script(Scripted::Refuse("NoSegment".into()));

        let report = matcher(store, connector.clone(), 1)
            .match_all()
            .await
            .unwrap();

        let expected: BTreeMap<String, usize> = [
            ("NoSegment -> Skipped".to_string(), 1),
            ("OK -> OK".to_string(), 1),
            ("Skipped -> Skipped".to_string(), 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(report.statuses, expected);
        assert_eq!(report.processed(), 3);
        assert_eq!(connector.engine.calls(), 3);
    }

    fn matched_trip(id: TripId) -> Trip {
        let mut trip = Trip::unmatched(id);
        trip.match_status = Some(TripStatus::Ok);
        trip
    }

    fn stored_tracepoints(trip_id: TripId, count: i32) -> Vec<RouteTracepoint> {
        (0..count)
            .map(|i| RouteTracepoint {
                geometry: geo::Point::new(-88.2 + 0.001 * i as f64, 40.1),
                trip_id,
                point_id: Some(i),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_alternatives_backfill_missing_fastest_routes() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(matched_trip(1), Vec::new()).await;
        store.add_tracepoints(stored_tracepoints(1, 4)).await;
        let mut routed = matched_trip(2);
        routed.fastest_status = Some(TripStatus::Ok);
        store.add_trip(routed, Vec::new()).await;
        store.add_tracepoints(stored_tracepoints(2, 4)).await;
        store.add_trip(Trip::unmatched(3), trace(3, 8)).await;
        // Matched, but nothing was snapped
        store.add_trip(matched_trip(4), Vec::new()).await;

        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Reply(fastest()));

        let report = matcher(store.clone(), connector.clone(), 10)
            .find_alternatives()
            .await
            .unwrap();

        let expected: BTreeMap<String, usize> = [("OK".to_string(), 1), ("Skipped".to_string(), 1)]
            .into_iter()
            .collect();
        assert_eq!(report.statuses, expected);
        assert!(report.is_clean());
        assert_eq!(connector.engine.calls(), 1);

        let trip = store.trip(1).await.unwrap();
        assert_eq!(trip.status_label(), "OK -> OK");
        assert_eq!(trip.fastest_distance, Some(450.0));
        let legs = store.legs(1).await;
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].route_type, RouteType::Fastest);
        assert_eq!(
            (legs[0].start_point_id, legs[0].end_point_id),
            (Some(0), Some(3))
        );

        let skipped = store.trip(4).await.unwrap();
        assert_eq!(skipped.fastest_status, Some(TripStatus::Skipped));
        assert_eq!(skipped.fastest_distance, Some(0.0));
        assert!(store.legs(2).await.is_empty());
        assert_eq!(store.trip(3).await.unwrap().match_status, None);
    }

    #[tokio::test]
    async fn test_alternatives_retry_after_routing_failure() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(matched_trip(1), Vec::new()).await;
        store.add_tracepoints(stored_tracepoints(1, 3)).await;
        let connector = ScriptedConnector::default();
        connector.engine.script(Scripted::Refuse("NoRoute".into()));
        connector.engine.script(Scripted::Reply(fastest()));
        let matcher = matcher(store.clone(), connector, 10);

        let report = matcher.find_alternatives().await.unwrap();
        assert_eq!(report.statuses.get("NoRoute"), Some(&1));
        assert_eq!(store.trip(1).await.unwrap().fastest_status, None);
        assert!(store.legs(1).await.is_empty());

        let report = matcher.find_alternatives().await.unwrap();
        assert_eq!(report.statuses.get("OK"), Some(&1));
        assert_eq!(store.trip(1).await.unwrap().fastest_status, Some(TripStatus::Ok));
        assert_eq!(store.legs(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_tracepoints_in_insertion_order() {
        let store = MemoryTripStore::new();
        store.add_tracepoints(stored_tracepoints(1, 5)).await;
        store.add_tracepoints(stored_tracepoints(2, 1)).await;

        let ends = store.get_endpoint_tracepoints(1).await.unwrap();
        let ids: Vec<_> = ends.iter().map(|t| t.point_id).collect();
        assert_eq!(ids, vec![Some(0), Some(4)]);
        assert_eq!(store.get_endpoint_tracepoints(2).await.unwrap().len(), 2);
        assert!(store.get_endpoint_tracepoints(3).await.unwrap().is_empty());
    }

    #[test]
    fn test_fastest_query_uses_tracepoint_ends() {
        let tracepoints: Vec<RouteTracepoint> = (0..4)
            .map(|i| RouteTracepoint {
                geometry: geo::Point::new(i as f64, 0.0),
                trip_id: 9,
                point_id: Some(i),
            })
            .collect();
        let query = fastest_query(9, &tracepoints).unwrap();
        assert_eq!(query.point_ids, vec![Some(0), Some(3)]);
        assert_eq!(query.coordinates[1], geo::Point::new(3.0, 0.0));
        assert!(query.timestamps.is_empty());
        assert!(fastest_query(9, &[]).is_none());
    }
}
