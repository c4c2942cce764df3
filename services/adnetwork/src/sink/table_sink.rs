use super::{BidSink, SinkError};
use crate::auction::AdvertiserCatalog;
use crate::bid::Bid;
use crate::config::TableStoreConfig;
use crate::identifier::Identifier;
use crate::table_store::{QualifierSequence, TableError, TableStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Writes each identifier's bids in one table transaction.
///
/// Row key is the identifier, column family the advertiser and every bid gets
/// a fresh qualifier, so repeated bids accumulate as separate cells. Values are
/// 8-byte big-endian IEEE-754.
pub struct TableSink {
    store: Arc<TableStore>,
    qualifiers: QualifierSequence,
}

impl TableSink {
    pub fn new(store: Arc<TableStore>) -> Self {
        Self::with_qualifiers(store, QualifierSequence::new())
    }

    pub fn with_qualifiers(store: Arc<TableStore>, qualifiers: QualifierSequence) -> Self {
        Self { store, qualifiers }
    }

    /// Open the store and declare one family per advertiser
    pub async fn open(
        config: &TableStoreConfig,
        catalog: &AdvertiserCatalog,
    ) -> Result<Self, TableError> {
        let store = TableStore::open(config).await?;
        store
            .ensure_families(catalog.categories().map(|c| c.as_str()))
            .await?;

        // Never reuse a qualifier, even if the clock went backwards since the last run
        let last = store.max_qualifier().await?;
        Ok(Self::with_qualifiers(
            Arc::new(store),
            QualifierSequence::after(last),
        ))
    }

    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    async fn write_batch(&self, identifier: &Identifier, bids: &[Bid]) -> Result<(), TableError> {
        let mut tx = self.store.begin().await?;

        for bid in bids {
            let put = tx
                .put(
                    identifier.as_str(),
                    bid.category.as_str(),
                    self.qualifiers.next(),
                    &bid.amount.to_be_bytes(),
                )
                .await;

            if let Err(e) = put {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Explicit rollback failed, transaction dropped");
                }
                return Err(e);
            }
        }

        tx.commit().await
    }
}

#[async_trait]
impl BidSink for TableSink {
    #[instrument(skip(self, identifier, bids), fields(identifier = %identifier, bids = bids.len()))]
    async fn persist(&self, identifier: &Identifier, bids: &[Bid]) -> Result<(), SinkError> {
        match self.write_batch(identifier, bids).await {
            Ok(()) => {
                debug!("Bid transaction committed");
                metrics::counter!("adnetwork.bids.persisted").increment(bids.len() as u64);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Bid transaction rolled back");
                metrics::counter!("adnetwork.batches.rolled_back").increment(1);
                Err(SinkError::RolledBack {
                    identifier: identifier.clone(),
                    source: e,
                })
            }
        }
    }

    fn sink_type(&self) -> &'static str {
        "table"
    }
}
