//! Change detection over the price/availability projection of a record.

use std::collections::HashSet;

use sailsync_core::{CabinPrices, PricingGrid, Sailing, SourceRecord};
use sailsync_storage::sha256_hex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChecksumError {
    /// serde_json writes NaN and infinities as `null`, which would collide with a missing price.
    #[error("non-finite price in {0}")]
    NonFinite(&'static str),
    #[error("encoding price projection: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Only the fields that affect displayed price or availability. Metadata such
/// as names, cache timestamps or ship content never enters the checksum.
#[derive(Serialize)]
struct PriceProjection<'a> {
    prices: &'a CabinPrices,
    cheapest_price: Option<f64>,
    is_available: bool,
    pricing: &'a PricingGrid,
}

pub fn price_checksum(record: &SourceRecord) -> Result<String, ChecksumError> {
    let cabins = [
        record.prices.interior,
        record.prices.oceanview,
        record.prices.balcony,
        record.prices.suite,
    ];
    if cabins.iter().flatten().any(|p| !p.is_finite()) {
        return Err(ChecksumError::NonFinite("cabin prices"));
    }
    if record.cheapest_price.is_some_and(|p| !p.is_finite()) {
        return Err(ChecksumError::NonFinite("cheapest price"));
    }

    let projection = PriceProjection {
        prices: &record.prices,
        cheapest_price: record.cheapest_price,
        is_available: record.is_available(),
        pricing: &record.pricing,
    };
    // Struct fields and BTreeMap keys serialize in a fixed order.
    let encoded = serde_json::to_vec(&projection)?;
    Ok(sha256_hex(&encoded))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    New,
    Changed { previous: Box<Sailing> },
    Unchanged,
}

pub fn classify(existing: Option<Sailing>, checksum: &str) -> Change {
    match existing {
        None => Change::New,
        Some(sailing) if sailing.checksum == checksum => Change::Unchanged,
        Some(sailing) => Change::Changed {
            previous: Box::new(sailing),
        },
    }
}

/// Secondary entities already written during one scope pass.
#[derive(Debug, Default)]
pub struct PassMemory {
    ships: HashSet<i32>,
}

impl PassMemory {
    /// `true` the first time a ship is seen in this pass.
    pub fn first_sight_of_ship(&mut self, ship_id: i32) -> bool {
        self.ships.insert(ship_id)
    }

    pub fn ships_written(&self) -> usize {
        self.ships.len()
    }
}
