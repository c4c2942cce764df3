//! Transactional wide-column table backed by SQLite.
//!
//! Rows are keyed by identifier, each row holds one column family per
//! advertiser and each family holds any number of cells addressed by a
//! qualifier. A put into a family that was never declared fails, and nothing
//! written inside a transaction is visible to other transactions until commit.

use crate::config::TableStoreConfig;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the table store
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Column family {family} does not exist")]
    UnknownFamily { family: String },

    #[error("Cell {row_key}/{family}/{qualifier} already exists")]
    CellExists {
        row_key: String,
        family: String,
        qualifier: u64,
    },
}

/// Column qualifier. Encoded big-endian so byte order matches numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qualifier(pub u64);

impl Qualifier {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

/// Hands out strictly increasing qualifiers.
///
/// Seeded from the wall clock so qualifiers written after a restart sort after
/// the ones written before it.
#[derive(Debug)]
pub struct QualifierSequence {
    next: AtomicU64,
}

impl QualifierSequence {
    pub fn new() -> Self {
        Self::after(None)
    }

    /// Start past both the wall clock and the highest qualifier already stored
    pub fn after(last: Option<Qualifier>) -> Self {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let floor = last.map_or(0, |q| q.0.saturating_add(1));
        Self::starting_at(now.max(floor))
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next(&self) -> Qualifier {
        Qualifier(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for QualifierSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// One stored cell
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub qualifier: Qualifier,
    pub value: Vec<u8>,
}

impl Cell {
    /// Decode an 8-byte big-endian IEEE-754 value
    pub fn as_f64(&self) -> Option<f64> {
        let bytes: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(f64::from_be_bytes(bytes))
    }
}

/// Every cell of one row, grouped by family and ordered by qualifier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    pub key: String,
    pub families: BTreeMap<String, Vec<Cell>>,
}

impl TableRow {
    pub fn family(&self, name: &str) -> &[Cell] {
        self.families.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cell_count(&self) -> usize {
        self.families.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }
}

#[derive(Debug, FromRow)]
struct CellRecord {
    family: String,
    qualifier: Vec<u8>,
    value: Vec<u8>,
}

/// Handle to the bid table
pub struct TableStore {
    pool: SqlitePool,
    families: parking_lot::RwLock<BTreeSet<String>>,
}

impl TableStore {
    /// Open the database described by `config` and apply the schema
    pub async fn open(config: &TableStoreConfig) -> Result<Self, TableError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(config.create_if_missing)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM column_families")
            .fetch_all(&pool)
            .await?;

        info!(url = %config.url, families = names.len(), "Opened bid table");

        Ok(Self {
            pool,
            families: parking_lot::RwLock::new(names.into_iter().map(|(n,)| n).collect()),
        })
    }

    /// Declare column families, keeping any that already exist
    pub async fn ensure_families<I, S>(&self, names: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        let mut tx = self.pool.begin().await?;
        for name in &names {
            sqlx::query("INSERT OR IGNORE INTO column_families (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let mut families = self.families.write();
        for name in names {
            debug!(family = %name, "Column family declared");
            families.insert(name);
        }

        Ok(())
    }

    pub fn has_family(&self, name: &str) -> bool {
        self.families.read().contains(name)
    }

    /// Start a transaction
    pub async fn begin(&self) -> Result<TableTransaction<'_>, TableError> {
        let tx = self.pool.begin().await?;
        Ok(TableTransaction { store: self, tx })
    }

    /// Read a row outside of any explicit transaction
    pub async fn get_row(&self, row_key: &str) -> Result<TableRow, TableError> {
        let mut tx = self.begin().await?;
        let row = tx.get_row(row_key).await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Highest qualifier written to any cell
    pub async fn max_qualifier(&self) -> Result<Option<Qualifier>, TableError> {
        let max: Option<Vec<u8>> = sqlx::query_scalar("SELECT MAX(qualifier) FROM cells")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.as_deref().and_then(Qualifier::from_bytes))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub struct TableTransaction<'a> {
    store: &'a TableStore,
    tx: Transaction<'static, Sqlite>,
}

impl TableTransaction<'_> {
    /// Write one cell. Fails if a cell already exists at the same coordinates.
    #[instrument(skip(self, value))]
    pub async fn put(
        &mut self,
        row_key: &str,
        family: &str,
        qualifier: Qualifier,
        value: &[u8],
    ) -> Result<(), TableError> {
        if !self.store.has_family(family) {
            return Err(TableError::UnknownFamily {
                family: family.to_string(),
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO cells (row_key, family, qualifier, value)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(row_key)
        .bind(family)
        .bind(qualifier.to_bytes().to_vec())
        .bind(value)
        .execute(&mut *self.tx)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(TableError::CellExists {
                    row_key: row_key.to_string(),
                    family: family.to_string(),
                    qualifier: qualifier.0,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a row as seen by this transaction
    pub async fn get_row(&mut self, row_key: &str) -> Result<TableRow, TableError> {
        let records = sqlx::query_as::<_, CellRecord>(
            r#"
            SELECT family, qualifier, value
            FROM cells
            WHERE row_key = ?
            ORDER BY family ASC, qualifier ASC
            "#,
        )
        .bind(row_key)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut row = TableRow {
            key: row_key.to_string(),
            families: BTreeMap::new(),
        };
        for record in records {
            // Qualifiers are only ever written by `put`, always 8 bytes
            let Some(qualifier) = Qualifier::from_bytes(&record.qualifier) else {
                continue;
            };
            row.families.entry(record.family).or_default().push(Cell {
                qualifier,
                value: record.value,
            });
        }

        Ok(row)
    }

    pub async fn commit(self) -> Result<(), TableError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), TableError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
