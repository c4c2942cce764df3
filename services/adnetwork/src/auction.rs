//! Synthetic auction with per-advertiser frequency decay.
//!
//! Every advertiser in the catalog bids once for each identifier handed to the
//! engine. An advertiser that has already bid `k` times for the same identifier
//! bids `base / sqrt(2)^k`.

use crate::bid::{AdvertiserCategory, Bid};
use crate::identifier::Identifier;
use std::collections::HashMap;
use std::f64::consts::SQRT_2;
use thiserror::Error;
use tracing::debug;

/// Errors building an advertiser catalog
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Advertiser catalog is empty")]
    Empty,

    #[error("Advertiser {0} is listed more than once")]
    Duplicate(AdvertiserCategory),

    #[error("Base amount for {category} must be positive and finite, got {amount}")]
    InvalidAmount {
        category: AdvertiserCategory,
        amount: f64,
    },
}

/// An advertiser and its undecayed bid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Advertiser {
    pub category: AdvertiserCategory,
    pub base_amount: f64,
}

/// Fixed set of advertisers, ordered by category declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertiserCatalog {
    advertisers: Vec<Advertiser>,
}

impl AdvertiserCatalog {
    pub fn new(
        entries: impl IntoIterator<Item = (AdvertiserCategory, f64)>,
    ) -> Result<Self, CatalogError> {
        let mut advertisers: Vec<Advertiser> = Vec::new();

        for (category, base_amount) in entries {
            if !base_amount.is_finite() || base_amount <= 0.0 {
                return Err(CatalogError::InvalidAmount {
                    category,
                    amount: base_amount,
                });
            }
            if advertisers.iter().any(|a| a.category == category) {
                return Err(CatalogError::Duplicate(category));
            }
            advertisers.push(Advertiser {
                category,
                base_amount,
            });
        }

        if advertisers.is_empty() {
            return Err(CatalogError::Empty);
        }

        advertisers.sort_by_key(|a| a.category);
        Ok(Self { advertisers })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Advertiser> {
        self.advertisers.iter()
    }

    pub fn len(&self) -> usize {
        self.advertisers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advertisers.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = AdvertiserCategory> + '_ {
        self.advertisers.iter().map(|a| a.category)
    }
}

/// Bids placed so far per (identifier, advertiser) for the process lifetime
#[derive(Debug, Default)]
pub struct OccurrenceCounter {
    counts: HashMap<(Identifier, AdvertiserCategory), u32>,
}

impl OccurrenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &Identifier, category: AdvertiserCategory) -> u32 {
        self.counts
            .get(&(identifier.clone(), category))
            .copied()
            .unwrap_or(0)
    }

    /// Return the current count and advance it by one
    fn bump(&mut self, identifier: &Identifier, category: AdvertiserCategory) -> u32 {
        let count = self
            .counts
            .entry((identifier.clone(), category))
            .or_insert(0);
        let current = *count;
        *count += 1;
        current
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Decayed amount for an advertiser's `occurrence`-th bid on the same identifier
pub fn decayed_amount(base_amount: f64, occurrence: u32) -> f64 {
    base_amount / SQRT_2.powf(f64::from(occurrence))
}

/// Produces bids for drained identifiers.
///
/// Owns its occurrence counters; must only be driven from one call chain.
#[derive(Debug)]
pub struct AuctionEngine {
    catalog: AdvertiserCatalog,
    counter: OccurrenceCounter,
}

impl AuctionEngine {
    pub fn new(catalog: AdvertiserCatalog) -> Self {
        Self::with_counter(catalog, OccurrenceCounter::new())
    }

    pub fn with_counter(catalog: AdvertiserCatalog, counter: OccurrenceCounter) -> Self {
        Self { catalog, counter }
    }

    pub fn catalog(&self) -> &AdvertiserCatalog {
        &self.catalog
    }

    pub fn counter(&self) -> &OccurrenceCounter {
        &self.counter
    }

    /// Forget every occurrence count
    pub fn reset(&mut self) {
        self.counter.clear();
    }

    /// One bid per advertiser, in catalog order
    pub fn compute_bids(&mut self, identifier: &Identifier) -> Vec<Bid> {
        let mut bids = Vec::with_capacity(self.catalog.len());

        for advertiser in self.catalog.iter() {
            let occurrence = self.counter.bump(identifier, advertiser.category);
            let amount = decayed_amount(advertiser.base_amount, occurrence);

            debug!(
                identifier = %identifier,
                category = %advertiser.category,
                occurrence,
                amount,
                "Placed bid"
            );

            bids.push(Bid {
                identifier: identifier.clone(),
                category: advertiser.category,
                amount,
                sequence: occurrence,
            });
        }

        metrics::counter!("adnetwork.bids.produced").increment(bids.len() as u64);
        bids
    }
}
