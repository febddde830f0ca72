use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use geo::{Coord, LineString, Point};
use log::info;
use thiserror::Error;

use crate::model::{PointId, RouteLeg, RouteTracepoint, RouteType, TripId};
use crate::osrm::{
    EngineConnector, EngineMessage, EngineResponse, Leg, RoutingEngine, Service, ServiceOptions,
    Waypoint,
};
use crate::task_queue::{QueueError, TaskOptions, Worker, WorkerTaskQueue};

/// Engine binding and per-request limits
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Road network the engine handle is bound to
    pub network: String,
    pub timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// A routing call that produced no solution
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The engine answered but refused the request
    #[error("{0}")]
    Engine(String),
}

/// Input to the routing worker
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub network: String,
    pub service: Service,
    pub options: ServiceOptions,
}

/// Owns the engine handle. The handle is built on first use and rebuilt
/// whenever a request names a different network.
pub struct OsrmWorker<C: EngineConnector> {
    connector: Arc<C>,
    engine: Option<(String, C::Engine)>,
}

impl<C: EngineConnector> OsrmWorker<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            engine: None,
        }
    }
}

impl<C: EngineConnector> Worker for OsrmWorker<C> {
    type Input = RoutingRequest;
    type Output = EngineMessage;

    async fn handle(&mut self, input: RoutingRequest) -> Result<EngineMessage> {
        let stale = match &self.engine {
            Some((network, _)) => *network != input.network,
            None => true,
        };
        if stale {
            info!("Loading routing engine for network {}", input.network);
            let engine = self.connector.connect(&input.network)?;
            self.engine = Some((input.network.clone(), engine));
        }

        match &self.engine {
            Some((_, engine)) => engine.call(input.service, &input.options).await,
            None => anyhow::bail!("Routing engine unavailable"),
        }
    }
}

/// A trace or endpoint pair to route, with the identifiers legs are tagged with
#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub coordinates: Vec<Point<f64>>,
    pub radiuses: Vec<f64>,
    /// Unix seconds per coordinate; empty to use the engine's own durations
    pub timestamps: Vec<i64>,
    pub route_type: RouteType,
    pub trip_id: TripId,
    /// Source point per coordinate
    pub point_ids: Vec<Option<PointId>>,
}

impl RouteQuery {
    fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            coordinates: self.coordinates.clone(),
            radiuses: self.radiuses.clone(),
            timestamps: self.timestamps.clone(),
            steps: true,
            annotations: true,
        }
    }
}

/// Legs and snapped points of one routing call, ready to store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteResult {
    pub legs: Vec<RouteLeg>,
    pub tracepoints: Vec<RouteTracepoint>,
}

/// Routing engine access shared by every trip pipeline. All calls are
/// serialized through one worker.
pub struct RoutingClient<C: EngineConnector> {
    queue: WorkerTaskQueue<OsrmWorker<C>>,
    config: RoutingConfig,
}

impl<C: EngineConnector> RoutingClient<C> {
    /// Spawn the worker queue. The engine is not contacted until the first run.
    pub fn new(connector: C, config: RoutingConfig) -> Self {
        let connector = Arc::new(connector);
        let queue = WorkerTaskQueue::new(move || OsrmWorker::new(connector.clone()));
        Self { queue, config }
    }

    /// Queue one engine call and shape its answer. Calls from every caller
    /// run one at a time in push order.
    pub async fn run(&self, service: Service, query: &RouteQuery) -> Result<RouteResult, RoutingError> {
        let request = RoutingRequest {
            network: self.config.network.clone(),
            service,
            options: query.service_options(),
        };
        let options = TaskOptions {
            timeout: Some(self.config.timeout),
        };

        match self.queue.push(request, options).await? {
            EngineMessage::Ok(response) => Ok(shape_response(&response, service, query)),
            EngineMessage::Error(message) => Err(RoutingError::Engine(message)),
        }
    }

    /// Times the worker was replaced after a crash or timeout
    pub fn worker_restarts(&self) -> usize {
        self.queue.recreate_count()
    }

    /// Let queued calls finish, then stop the worker
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
    }
}

/// A matched waypoint together with what the caller supplied at its position
struct AlignedWaypoint<'a> {
    waypoint: &'a Waypoint,
    point_id: Option<PointId>,
    timestamp: Option<i64>,
}

/// Turn an engine solution into leg and tracepoint records.
///
/// Unmatched (null) waypoints are skipped together with the id and timestamp
/// supplied at the same position.
pub fn shape_response(response: &EngineResponse, service: Service, query: &RouteQuery) -> RouteResult {
    let (solutions, waypoints) = match service {
        Service::Match => (&response.matchings, &response.tracepoints),
        Service::Route => (&response.routes, &response.waypoints),
    };

    let aligned: Vec<AlignedWaypoint> = waypoints
        .iter()
        .enumerate()
        .filter_map(|(i, waypoint)| {
            waypoint.as_ref().map(|waypoint| AlignedWaypoint {
                waypoint,
                point_id: query.point_ids.get(i).copied().flatten(),
                timestamp: query.timestamps.get(i).copied(),
            })
        })
        .collect();

    let tracepoints = aligned
        .iter()
        .map(|a| RouteTracepoint {
            geometry: Point::new(a.waypoint.location[0], a.waypoint.location[1]),
            trip_id: query.trip_id,
            point_id: a.point_id,
        })
        .collect();

    let mut legs = Vec::new();
    for (matching, solution) in solutions.iter().enumerate() {
        // Route waypoints carry no solution index and all belong to route 0
        let endpoints: Vec<&AlignedWaypoint> = aligned
            .iter()
            .filter(|a| service == Service::Route || a.waypoint.matchings_index == matching)
            .collect();

        for (index, leg) in solution.legs.iter().enumerate() {
            let start = endpoints.get(index).copied();
            let end = endpoints.get(index + 1).copied();
            let duration = match (start.and_then(|a| a.timestamp), end.and_then(|a| a.timestamp)) {
                (Some(from), Some(to)) => (to - from) as f64,
                _ => leg.duration,
            };

            legs.push(RouteLeg {
                matching,
                leg: index,
                distance: leg.distance,
                duration,
                speed: leg.distance / duration,
                nodes: leg
                    .annotation
                    .as_ref()
                    .map(|a| a.nodes.clone())
                    .unwrap_or_default(),
                geometry: leg_geometry(leg),
                route_type: query.route_type,
                trip_id: query.trip_id,
                start_point_id: start.and_then(|a| a.point_id),
                end_point_id: end.and_then(|a| a.point_id),
                speed_outlier: false,
            });
        }
    }

    RouteResult { legs, tracepoints }
}

/// Concatenate step geometries, skipping repeated consecutive coordinates.
/// A leg that never moves keeps its single coordinate twice so the line stays
/// valid for PostGIS.
fn leg_geometry(leg: &Leg) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = Vec::new();
    for step in &leg.steps {
        for [x, y] in &step.geometry.coordinates {
            let coord = Coord { x: *x, y: *y };
            if coords.last() != Some(&coord) {
                coords.push(coord);
            }
        }
    }
    if let &[only] = coords.as_slice() {
        coords.push(only);
    }
    LineString::new(coords)
}
