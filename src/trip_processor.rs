use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};

use crate::osrm::EngineConnector;
use crate::store::TripStore;
use crate::trip_matcher::{BatchReport, TripMatcher};

/// Runs matching batches, once or on a schedule
pub struct TripProcessor<S: TripStore, C: EngineConnector> {
    matcher: Arc<TripMatcher<S, C>>,
    processing: Arc<Mutex<bool>>,
}

impl<S: TripStore, C: EngineConnector> TripProcessor<S, C> {
    /// A processor that is not running a batch yet
    pub fn new(matcher: Arc<TripMatcher<S, C>>) -> Self {
        Self {
            matcher,
            processing: Arc::new(Mutex::new(false)),
        }
    }

    /// Rerun the batch every `interval`
    pub async fn start_scheduler(&self, interval: Duration) {
        let mut interval = time::interval(interval);

        info!("Starting trip matching scheduler");

        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(Some(report)) if !report.is_clean() => error!(
                    "{} trips could not be persisted in this run",
                    report.failures.len()
                ),
                Ok(_) => {}
                Err(e) => error!("Error matching trips: {:#}", e),
            }
        }
    }

    /// Match all pending trips. Returns `None` when a run is already in progress.
    pub async fn run_once(&self) -> Result<Option<BatchReport>> {
        let mut processing = self.processing.lock().await;
        if *processing {
            info!("Trip matching already in progress, skipping");
            return Ok(None);
        }
        *processing = true;
        drop(processing);

        info!("Starting matching run");
        let result = self.matcher.match_all().await;

        let mut processing = self.processing.lock().await;
        *processing = false;

        let report = result?;
        info!(
            "Matching run finished: {} trips processed, {} failures",
            report.processed(),
            report.failures.len()
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Trip, TripStatus};
    use crate::point_filter::tests::zigzag;
    use crate::routing::tests::ScriptedConnector;
    use crate::routing::{RoutingClient, RoutingConfig};
    use crate::store::MemoryTripStore;
    use crate::trip_matcher::TripMatcherConfig;

    fn processor(store: Arc<MemoryTripStore>) -> TripProcessor<MemoryTripStore, ScriptedConnector> {
        let routing = RoutingClient::new(ScriptedConnector::default(), RoutingConfig::default());
        let matcher = TripMatcher::new(store, routing, TripMatcherConfig::default());
        TripProcessor::new(Arc::new(matcher))
    }

    #[tokio::test]
    async fn test_run_once_matches_pending_trips() {
        let store = Arc::new(MemoryTripStore::new());
        store.add_trip(Trip::unmatched(1), zigzag(3)).await;
        let processor = processor(store.clone());

        let report = processor.run_once().await.unwrap().unwrap();
        assert_eq!(report.processed(), 1);
        assert_eq!(
            store.trip(1).await.unwrap().match_status,
            Some(TripStatus::Skipped)
        );

        // Matched trips are not picked up again
        let report = processor.run_once().await.unwrap().unwrap();
        assert_eq!(report.processed(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let processor = processor(Arc::new(MemoryTripStore::new()));
        *processor.processing.lock().await = true;
        assert!(processor.run_once().await.unwrap().is_none());

        *processor.processing.lock().await = false;
        assert!(processor.run_once().await.unwrap().is_some());
    }
}
