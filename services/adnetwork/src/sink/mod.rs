//! Durable bid persistence.
//!
//! Exactly one sink is active for the lifetime of the process, chosen from the
//! configuration at startup.

mod file_sink;
mod table_sink;

pub use file_sink::FileSink;
pub use table_sink::TableSink;

use crate::auction::AdvertiserCatalog;
use crate::bid::Bid;
use crate::config::{SinkSelection, TableStoreConfig};
use crate::identifier::Identifier;
use crate::table_store::TableError;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Errors raised while persisting bids
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to append to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize bid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction for {identifier} rolled back: {source}")]
    RolledBack {
        identifier: Identifier,
        #[source]
        source: TableError,
    },
}

impl SinkError {
    /// Whether the pipeline must stop rather than move on to the next batch
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Io { .. } | SinkError::Serialization(_) => true,
            SinkError::RolledBack { .. } => false,
        }
    }
}

/// Persists the bids produced for one identifier
#[async_trait]
pub trait BidSink: Send + Sync {
    /// Persist every bid of one identifier's auction
    async fn persist(&self, identifier: &Identifier, bids: &[Bid]) -> Result<(), SinkError>;

    /// Sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Open the sink selected by the configuration
pub async fn open_sink(
    selection: &SinkSelection,
    catalog: &AdvertiserCatalog,
) -> anyhow::Result<Box<dyn BidSink>> {
    let sink: Box<dyn BidSink> = match selection {
        SinkSelection::File { path } => Box::new(
            FileSink::open(path)
                .await
                .with_context(|| format!("Failed to open bid file {}", path.display()))?,
        ),
        SinkSelection::Table { conf_path } => {
            let store_config = TableStoreConfig::load(conf_path).with_context(|| {
                format!("Failed to read table store config {}", conf_path.display())
            })?;
            Box::new(
                TableSink::open(&store_config, catalog)
                    .await
                    .context("Failed to open bid table")?,
            )
        }
    };

    info!(sink = sink.sink_type(), "Bid sink ready");
    Ok(sink)
}
