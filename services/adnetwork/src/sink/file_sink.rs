use super::{BidSink, SinkError};
use crate::bid::Bid;
use crate::identifier::Identifier;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Appends one JSON line per bid.
///
/// Every line is written and flushed on its own; there is no grouping across
/// bids.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Writing bids to file");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl BidSink for FileSink {
    #[instrument(skip(self, identifier, bids), fields(identifier = %identifier, bids = bids.len()))]
    async fn persist(&self, identifier: &Identifier, bids: &[Bid]) -> Result<(), SinkError> {
        let mut file = self.file.lock().await;

        for bid in bids {
            let mut line = serde_json::to_string(bid)?;
            line.push('\n');

            file.write_all(line.as_bytes())
                .await
                .map_err(|e| self.io_error(e))?;
            file.flush().await.map_err(|e| self.io_error(e))?;

            metrics::counter!("adnetwork.bids.persisted").increment(1);
        }

        debug!("Bids appended");
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::{AdvertiserCatalog, AuctionEngine};
    use crate::bid::AdvertiserCategory;

    fn engine() -> AuctionEngine {
        AuctionEngine::new(
            AdvertiserCatalog::new([
                (AdvertiserCategory::Music, 15.0),
                (AdvertiserCategory::Travel, 12.0),
            ])
            .unwrap(),
        )
    }

    fn read_bids(path: &Path) -> Vec<Bid> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_appends_one_line_per_bid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let sink = FileSink::open(&path).await.unwrap();
        let mut engine = engine();

        for raw in ["test-user-0", "test-user-1", "test-user-0"] {
            let id = Identifier::parse(raw).unwrap();
            let bids = engine.compute_bids(&id);
            sink.persist(&id, &bids).await.unwrap();
        }

        let bids = read_bids(&path);
        assert_eq!(bids.len(), 6);

        assert_eq!(bids[0].identifier.as_str(), "test-user-0");
        assert_eq!(bids[0].category, AdvertiserCategory::Music);
        assert_eq!(bids[0].amount, 15.0);
        assert_eq!(bids[1].category, AdvertiserCategory::Travel);
        assert_eq!(bids[1].amount, 12.0);

        assert_eq!(bids[2].identifier.as_str(), "test-user-1");
        assert_eq!(bids[2].amount, 15.0);

        assert_eq!(bids[4].identifier.as_str(), "test-user-0");
        assert_eq!(bids[4].category, AdvertiserCategory::Music);
        assert_eq!(bids[4].amount, 10.606601717798211);
        assert_eq!(bids[4].sequence, 1);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bids.jsonl");
        let id = Identifier::parse("test-user-0").unwrap();
        let mut engine = engine();

        {
            let sink = FileSink::open(&path).await.unwrap();
            sink.persist(&id, &engine.compute_bids(&id)).await.unwrap();
        }
        let sink = FileSink::open(&path).await.unwrap();
        sink.persist(&id, &engine.compute_bids(&id)).await.unwrap();

        assert_eq!(read_bids(&path).len(), 4);
        assert_eq!(sink.path(), path.as_path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_failure_is_fatal_io_error() {
        let sink = FileSink::open("/dev/full").await.unwrap();
        let id = Identifier::parse("test-user-0").unwrap();
        let bids = engine().compute_bids(&id);

        let err = sink.persist(&id, &bids).await.unwrap_err();
        assert!(err.is_fatal());
        match err {
            SinkError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/dev/full"));
                assert_eq!(source.raw_os_error(), Some(28));
            }
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("bids.jsonl");
        assert!(FileSink::open(&path).await.is_err());
    }
}
