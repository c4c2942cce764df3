use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Advertiser categories taking part in every auction.
///
/// Declaration order is the order bids are emitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvertiserCategory {
    Music,
    Travel,
}

impl AdvertiserCategory {
    pub const ALL: [AdvertiserCategory; 2] = [AdvertiserCategory::Music, AdvertiserCategory::Travel];

    /// Name used on the wire and as the column family name
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvertiserCategory::Music => "MUSIC",
            AdvertiserCategory::Travel => "TRAVEL",
        }
    }
}

impl fmt::Display for AdvertiserCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bid placed by one advertiser for one identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// Identifier the bid was placed for
    #[serde(rename = "id")]
    pub identifier: Identifier,
    /// Bidding advertiser
    #[serde(rename = "item")]
    pub category: AdvertiserCategory,
    /// Bid amount after decay
    pub amount: f64,
    /// How many bids this advertiser had already placed for the identifier
    pub sequence: u32,
}
