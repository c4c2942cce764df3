//! Tick driver: drain, auction, persist.
//!
//! One tick polls a batch, runs an auction for every identifier in arrival
//! order and hands the bids to the sink. Ticks run one at a time on a single
//! task. A failed poll abandons the tick; the identifiers it would have carried
//! are not recovered.

use crate::auction::AuctionEngine;
use crate::batch_source::BatchSource;
use crate::ingest_api::PollBatch;
use crate::sink::{BidSink, SinkError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop the poller
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Bid sink failed: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Draining,
}

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The poll failed and the tick was abandoned
    pub skipped: bool,
    /// Identifiers auctioned
    pub identifiers: usize,
    /// Bids handed to the sink successfully
    pub bids_persisted: usize,
    /// Identifiers whose bids were rolled back
    pub rolled_back: usize,
}

pub struct IngestionPoller {
    source: Box<dyn BatchSource>,
    engine: AuctionEngine,
    sink: Box<dyn BidSink>,
    interval: Duration,
    state: PollerState,
}

impl IngestionPoller {
    pub fn new(
        source: Box<dyn BatchSource>,
        engine: AuctionEngine,
        sink: Box<dyn BidSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            sink,
            interval,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn engine(&self) -> &AuctionEngine {
        &self.engine
    }

    /// Run a single tick
    pub async fn tick(&mut self) -> Result<TickReport, PollerError> {
        self.state = PollerState::Draining;
        let result = self.drain_and_forward().await;
        self.state = PollerState::Idle;
        result
    }

    #[instrument(skip(self))]
    async fn drain_and_forward(&mut self) -> Result<TickReport, PollerError> {
        let mut report = TickReport::default();

        let ids = match self.source.poll_batch().await {
            Ok(PollBatch::Empty) => return Ok(report),
            Ok(PollBatch::Batch(ids)) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to poll identifiers, skipping tick");
                metrics::counter!("adnetwork.ticks.failed").increment(1);
                report.skipped = true;
                return Ok(report);
            }
        };

        debug!(batch_size = ids.len(), "Drained identifier batch");

        for id in ids {
            info!(identifier = %id, "Initiating ad auction");
            let bids = self.engine.compute_bids(&id);
            report.identifiers += 1;

            match self.sink.persist(&id, &bids).await {
                Ok(()) => report.bids_persisted += bids.len(),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(identifier = %id, error = %e, "Discarded bids after rollback");
                    report.rolled_back += 1;
                }
            }
        }

        Ok(report)
    }

    /// Tick every `interval` until shutdown or a fatal sink error.
    ///
    /// Shutdown is only observed between ticks. Ticks that fall behind are
    /// skipped rather than run back to back.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), PollerError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            source = self.source.source_type(),
            sink = self.sink.sink_type(),
            "Starting ingestion poller"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let result = self.tick().await;
                    metrics::counter!("adnetwork.ticks").increment(1);
                    metrics::histogram!("adnetwork.tick.duration_seconds")
                        .record(started.elapsed().as_secs_f64());

                    match result {
                        Ok(report) if report.identifiers > 0 => {
                            debug!(
                                identifiers = report.identifiers,
                                bids = report.bids_persisted,
                                rolled_back = report.rolled_back,
                                "Tick completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Stopping poller");
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::AdvertiserCatalog;
    use crate::batch_source::{LocalBatchSource, MockBatchSource, PollError};
    use crate::bid::{AdvertiserCategory, Bid};
    use crate::config::TableStoreConfig;
    use crate::identifier::Identifier;
    use crate::ingest_api::IngestionEndpoint;
    use crate::sink::{FileSink, TableSink};
    use crate::table_store::TableStore;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    const TOLERANCE: f64 = 1e-9;

    fn engine() -> AuctionEngine {
        AuctionEngine::new(
            AdvertiserCatalog::new([
                (AdvertiserCategory::Music, 15.0),
                (AdvertiserCategory::Travel, 12.0),
            ])
            .unwrap(),
        )
    }

    fn id(raw: &str) -> Identifier {
        Identifier::parse(raw).unwrap()
    }

    fn read_bids(path: &Path) -> Vec<Bid> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Sink whose file writes always fail
    struct BrokenFileSink;

    #[async_trait]
    impl BidSink for BrokenFileSink {
        async fn persist(&self, _identifier: &Identifier, _bids: &[Bid]) -> Result<(), SinkError> {
            Err(SinkError::Io {
                path: PathBuf::from("/dev/full"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
            })
        }

        fn sink_type(&self) -> &'static str {
            "broken"
        }
    }

    async fn file_poller(endpoint: &IngestionEndpoint, path: &Path) -> IngestionPoller {
        IngestionPoller::new(
            Box::new(LocalBatchSource::new(endpoint.clone())),
            engine(),
            Box::new(FileSink::open(path).await.unwrap()),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_identifier_processed_twice_decays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let endpoint = IngestionEndpoint::default();
        let mut poller = file_poller(&endpoint, &path).await;

        endpoint.register("test-user-0").unwrap();
        let report = poller.tick().await.unwrap();
        assert_eq!(report.identifiers, 1);
        assert_eq!(report.bids_persisted, 2);

        endpoint.register("test-user-0").unwrap();
        poller.tick().await.unwrap();

        let bids = read_bids(&path);
        assert_eq!(bids.len(), 4);
        assert_eq!(
            (bids[0].category, bids[0].amount),
            (AdvertiserCategory::Music, 15.0)
        );
        assert_eq!(
            (bids[1].category, bids[1].amount),
            (AdvertiserCategory::Travel, 12.0)
        );
        assert_eq!(bids[2].category, AdvertiserCategory::Music);
        assert!((bids[2].amount - 10.606601717798211).abs() < TOLERANCE);
        assert_eq!(bids[3].category, AdvertiserCategory::Travel);
        assert!((bids[3].amount - 8.485281374238571).abs() < TOLERANCE);
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_batch_forwarded_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let endpoint = IngestionEndpoint::default();
        let mut poller = file_poller(&endpoint, &path).await;

        for raw in ["test-user-1", "test-user-0", "test-user-1"] {
            endpoint.register(raw).unwrap();
        }
        let report = poller.tick().await.unwrap();
        assert_eq!(report.identifiers, 3);

        let bids = read_bids(&path);
        let order: Vec<_> = bids
            .iter()
            .map(|b| (b.identifier.as_str().to_string(), b.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                ("test-user-1".to_string(), 0),
                ("test-user-1".to_string(), 0),
                ("test-user-0".to_string(), 0),
                ("test-user-0".to_string(), 0),
                ("test-user-1".to_string(), 1),
                ("test-user-1".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_tick_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let endpoint = IngestionEndpoint::default();
        let mut poller = file_poller(&endpoint, &path).await;

        assert_eq!(poller.tick().await.unwrap(), TickReport::default());
        assert!(read_bids(&path).is_empty());
        assert!(poller.engine().counter().is_empty());
    }

    #[tokio::test]
    async fn test_failed_poll_skips_tick_and_loses_nothing_else() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");

        let mut source = MockBatchSource::new();
        source
            .expect_poll_batch()
            .times(1)
            .returning(|| Err(PollError::Transport("connection reset".to_string())));
        source
            .expect_poll_batch()
            .times(1)
            .returning(|| Ok(PollBatch::Batch(vec![id("test-user-1")])));

        let mut poller = IngestionPoller::new(
            Box::new(source),
            engine(),
            Box::new(FileSink::open(&path).await.unwrap()),
            Duration::from_millis(10),
        );

        let first = poller.tick().await.unwrap();
        assert!(first.skipped);
        assert_eq!(first.identifiers, 0);
        assert_eq!(poller.state(), PollerState::Idle);

        let second = poller.tick().await.unwrap();
        assert!(!second.skipped);
        assert_eq!(second.identifiers, 1);

        let bids = read_bids(&path);
        assert_eq!(bids.len(), 2);
        assert!(bids.iter().all(|b| b.identifier.as_str() == "test-user-1"));
    }

    #[tokio::test]
    async fn test_file_sink_failure_is_fatal() {
        let endpoint = IngestionEndpoint::default();
        endpoint.register("test-user-0").unwrap();

        let mut poller = IngestionPoller::new(
            Box::new(LocalBatchSource::new(endpoint.clone())),
            engine(),
            Box::new(BrokenFileSink),
            Duration::from_millis(10),
        );

        let err = poller.tick().await.unwrap_err();
        assert!(matches!(err, PollerError::Sink(SinkError::Io { .. })));
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_disk_stops_tick() {
        let endpoint = IngestionEndpoint::default();
        endpoint.register("test-user-0").unwrap();
        let mut poller = file_poller(&endpoint, Path::new("/dev/full")).await;

        let err = poller.tick().await.unwrap_err();
        assert!(matches!(err, PollerError::Sink(SinkError::Io { .. })));
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal_sink_error() {
        let endpoint = IngestionEndpoint::default();
        endpoint.register("test-user-0").unwrap();

        let mut poller = IngestionPoller::new(
            Box::new(LocalBatchSource::new(endpoint.clone())),
            engine(),
            Box::new(BrokenFileSink),
            Duration::from_millis(10),
        );

        let (_tx, rx) = broadcast::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(5), poller.run(rx))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rollback_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = TableStoreConfig::for_path(&dir.path().join("bids.db"));
        let store = Arc::new(TableStore::open(&config).await.unwrap());
        store.ensure_families(["MUSIC"]).await.unwrap();

        let endpoint = IngestionEndpoint::default();
        endpoint.register("test-user-0").unwrap();
        endpoint.register("test-user-1").unwrap();

        let mut poller = IngestionPoller::new(
            Box::new(LocalBatchSource::new(endpoint.clone())),
            engine(),
            Box::new(TableSink::new(store.clone())),
            Duration::from_millis(10),
        );

        let report = poller.tick().await.unwrap();
        assert_eq!(report.identifiers, 2);
        assert_eq!(report.rolled_back, 2);
        assert_eq!(report.bids_persisted, 0);
        assert!(store.get_row("test-user-0").await.unwrap().is_empty());

        // Counters still advanced: the auction happened even though nothing was stored
        assert_eq!(
            poller
                .engine()
                .counter()
                .get(&id("test-user-0"), AdvertiserCategory::Music),
            1
        );
    }

    #[tokio::test]
    async fn test_run_processes_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let endpoint = IngestionEndpoint::default();
        let mut poller = file_poller(&endpoint, &path).await;
        endpoint.register("test-user-0").unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            poller.run(rx).await.unwrap();
            poller
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while read_bids(&path).len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();

        let poller = handle.await.unwrap();
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(read_bids(&path).len(), 2);
    }
}
