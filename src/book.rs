//! Per-symbol Level-2 order book.
//!
//! Two ordered maps keyed by the exact f64 price: bids iterate descending,
//! asks ascending. A zero-size update deletes its level. No crossing
//! protection and no tick rounding; the book represents whatever the feed
//! says, crossed or not.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::quote::{Quote, Side};
use crate::view::OrderBookSnapshot;

/// Total-order wrapper so exact f64 prices can key a BTreeMap.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One resting price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Aggregated book for a single symbol. Owned and mutated by the consumer
/// worker only; readers go through the published snapshots.
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Reverse<OrderedFloat>, PriceLevel>,
    asks: BTreeMap<OrderedFloat, PriceLevel>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply one quote: set the level, or erase it when `size == 0`.
    pub fn update(&mut self, quote: &Quote) {
        let price = quote.price;
        let size = quote.size;
        match quote.side {
            Side::Bid => {
                if size == 0.0 {
                    self.bids.remove(&Reverse(OrderedFloat(price)));
                } else {
                    self.bids
                        .insert(Reverse(OrderedFloat(price)), PriceLevel { price, size });
                }
            }
            Side::Ask => {
                if size == 0.0 {
                    self.asks.remove(&OrderedFloat(price));
                } else {
                    self.asks
                        .insert(OrderedFloat(price), PriceLevel { price, size });
                }
            }
        }
    }

    /// Greatest bid price, `0.0` when the side is empty.
    pub fn best_bid(&self) -> f64 {
        self.bids
            .first_key_value()
            .map(|(_, lvl)| lvl.price)
            .unwrap_or(0.0)
    }

    /// Least ask price, `0.0` when the side is empty.
    pub fn best_ask(&self) -> f64 {
        self.asks
            .first_key_value()
            .map(|(_, lvl)| lvl.price)
            .unwrap_or(0.0)
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Bid levels in descending price order.
    pub fn bids(&self) -> impl Iterator<Item = &PriceLevel> {
        self.bids.values()
    }

    /// Ask levels in ascending price order.
    pub fn asks(&self) -> impl Iterator<Item = &PriceLevel> {
        self.asks.values()
    }

    /// Value copy of the book truncated to `max_levels` per side
    /// (0 = unlimited). Empty sides are reported as NaN so readers can tell
    /// "no side" from a real zero price.
    pub fn snapshot(&self, max_levels: usize, mono_ns: u64) -> OrderBookSnapshot {
        let cap = if max_levels == 0 {
            usize::MAX
        } else {
            max_levels
        };

        let bid_levels: Vec<(f64, f64)> = self
            .bids
            .values()
            .take(cap)
            .map(|lvl| (lvl.price, lvl.size))
            .collect();
        let ask_levels: Vec<(f64, f64)> = self
            .asks
            .values()
            .take(cap)
            .map(|lvl| (lvl.price, lvl.size))
            .collect();

        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            best_bid: self
                .bids
                .first_key_value()
                .map(|(_, lvl)| lvl.price)
                .unwrap_or(f64::NAN),
            best_ask: self
                .asks
                .first_key_value()
                .map(|(_, lvl)| lvl.price)
                .unwrap_or(f64::NAN),
            bid_levels,
            ask_levels,
            mono_ns,
        }
    }
}
