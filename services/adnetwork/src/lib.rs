//! Ad Network Service
//!
//! Real-time ad auction pipeline. Clients register user identifiers over HTTP,
//! a poller drains them on a fixed tick, runs an auction per identifier across
//! the advertiser catalog and persists the resulting bids.
//!
//! ## Features
//!
//! - **Identifier Ingestion**: `POST /id/{identifier}` queues, `GET /id` drains
//! - **Decaying Bids**: each advertiser bids `base / √2^k` on the k-th
//!   occurrence of an identifier
//! - **Two Sinks**: an append-only JSON lines file, or a transactional
//!   wide-column table that keeps every bid version per advertiser
//!
//! ## Architecture
//!
//! ```text
//! HTTP clients
//!      │ POST /id/{id}
//!      ▼
//! ┌──────────────┐   drain    ┌──────────────┐          ┌──────────────┐
//! │ Ingestion    │◀───────────│ Ingestion    │  bids    │ Bid Sink     │
//! │ Endpoint     │  (GET /id) │ Poller       │─────────▶│ file | table │
//! └──────────────┘            └──────────────┘          └──────────────┘
//!      │                             │
//!      ▼                             ▼
//! ┌──────────────┐            ┌──────────────┐
//! │ Identifier   │            │ Auction      │
//! │ Queue        │            │ Engine       │
//! └──────────────┘            └──────────────┘
//! ```

pub mod auction;
pub mod batch_source;
pub mod bid;
pub mod config;
pub mod id_queue;
pub mod identifier;
pub mod ingest_api;
pub mod poller;
pub mod sink;
pub mod table_store;

pub use auction::{decayed_amount, AdvertiserCatalog, AuctionEngine, OccurrenceCounter};
pub use batch_source::{BatchSource, HttpBatchSource, LocalBatchSource, PollError};
pub use bid::{AdvertiserCategory, Bid};
pub use config::{Config, SinkSelection, TableStoreConfig};
pub use id_queue::IdentifierQueue;
pub use identifier::{Identifier, IdentifierError};
pub use ingest_api::{AppState, IngestServer, IngestionEndpoint, PollBatch};
pub use poller::{IngestionPoller, PollerError, PollerState, TickReport};
pub use sink::{open_sink, BidSink, FileSink, SinkError, TableSink};
pub use table_store::{TableStore, TableTransaction};
