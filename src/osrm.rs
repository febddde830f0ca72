use std::future::Future;

use anyhow::{Context, Result};
use geo::Point;
use log::debug;
use serde::Deserialize;

/// Engine service, also the URL path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Snap a noisy trace onto the road network
    Match,
    /// Fastest path between waypoints
    Route,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Match => "match",
            Service::Route => "route",
        }
    }
}

/// Request options for one engine call. Geometries are always requested as
/// GeoJSON without an overview.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceOptions {
    pub coordinates: Vec<Point<f64>>,
    /// Search radius per coordinate in meters; empty for the engine default
    pub radiuses: Vec<f64>,
    /// Unix seconds per coordinate; empty when unknown
    pub timestamps: Vec<i64>,
    pub steps: bool,
    pub annotations: bool,
}

/// What the engine answered: a solution, or its own refusal
#[derive(Debug, Clone)]
pub enum EngineMessage {
    Ok(EngineResponse),
    Error(String),
}

/// Body of a `match` or `route` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineResponse {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Solutions of the match service
    #[serde(default)]
    pub matchings: Vec<Solution>,
    /// Solutions of the route service
    #[serde(default)]
    pub routes: Vec<Solution>,
    /// One entry per input coordinate of the match service, null if unmatched
    #[serde(default)]
    pub tracepoints: Vec<Option<Waypoint>>,
    /// One entry per input coordinate of the route service
    #[serde(default)]
    pub waypoints: Vec<Option<Waypoint>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Solution {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub legs: Vec<Leg>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Leg {
    pub distance: f64,
    pub duration: f64,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub annotation: Option<Annotation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    pub geometry: StepGeometry,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepGeometry {
    #[serde(default)]
    pub coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub nodes: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Waypoint {
    /// `[lon, lat]` of the snapped position
    pub location: [f64; 2],
    #[serde(default)]
    pub matchings_index: usize,
}

/// A connection to a routing engine serving one road network
pub trait RoutingEngine: Send + Sync + 'static {
    /// `Err` means the connection itself failed; refusals come back as
    /// `EngineMessage::Error`.
    fn call(
        &self,
        service: Service,
        options: &ServiceOptions,
    ) -> impl Future<Output = Result<EngineMessage>> + Send;
}

/// Builds engine handles for named road networks
pub trait EngineConnector: Send + Sync + 'static {
    type Engine: RoutingEngine;

    fn connect(&self, network: &str) -> Result<Self::Engine>;
}

/// Connects to `osrm-routed` over HTTP; the network name is used as the
/// profile path segment.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    pub base_url: String,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl EngineConnector for HttpConnector {
    type Engine = HttpEngine;

    fn connect(&self, network: &str) -> Result<HttpEngine> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build routing HTTP client")?;
        Ok(HttpEngine {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            network: network.to_string(),
        })
    }
}

/// Engine handle for one profile of an `osrm-routed` server
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    network: String,
}

impl HttpEngine {
    fn url(&self, service: Service, options: &ServiceOptions) -> String {
        let coordinates: Vec<String> = options
            .coordinates
            .iter()
            .map(|p| format!("{},{}", p.x(), p.y()))
            .collect();
        format!(
            "{}/{}/v1/{}/{}",
            self.base_url,
            service.as_str(),
            self.network,
            coordinates.join(";")
        )
    }
}

/// Query string parameters for an engine call
pub fn query_params(options: &ServiceOptions) -> Vec<(&'static str, String)> {
    let join = |values: Vec<String>| values.join(";");
    let mut params = vec![
        ("overview", "false".to_string()),
        ("geometries", "geojson".to_string()),
        ("steps", options.steps.to_string()),
        ("annotations", options.annotations.to_string()),
    ];
    if !options.radiuses.is_empty() {
        params.push((
            "radiuses",
            join(options.radiuses.iter().map(|r| r.to_string()).collect()),
        ));
    }
    if !options.timestamps.is_empty() {
        params.push((
            "timestamps",
            join(options.timestamps.iter().map(|t| t.to_string()).collect()),
        ));
    }
    params
}

/// Interpret a decoded engine body
pub fn into_message(response: EngineResponse) -> EngineMessage {
    if response.code == "Ok" {
        EngineMessage::Ok(response)
    } else {
        EngineMessage::Error(response.message.unwrap_or(response.code))
    }
}

impl RoutingEngine for HttpEngine {
    async fn call(&self, service: Service, options: &ServiceOptions) -> Result<EngineMessage> {
        let url = self.url(service, options);
        debug!(
            "Calling {} with {} coordinates",
            service.as_str(),
            options.coordinates.len()
        );

        let response = self
            .client
            .get(&url)
            .query(&query_params(options))
            .send()
            .await
            .with_context(|| format!("Routing engine unreachable at {}", self.base_url))?;

        // osrm-routed reports refusals such as NoMatch with a 400 and a JSON body
        let status = response.status();
        let body: EngineResponse = response
            .json()
            .await
            .with_context(|| format!("Undecodable routing response ({})", status))?;
        Ok(into_message(body))
    }
}
