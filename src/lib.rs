//! quotegate - multi-venue market-data ingestion pipeline.
//!
//! Raw bytes from venue transports (secure websocket JSON, TCP FIX) are
//! parsed into uniform quotes, fanned out through bounded SPSC rings, folded
//! into a per-symbol Level-2 book, and published as immutable snapshots
//! through a wait-free double buffer for concurrent readers.

pub mod book;
pub mod config;
pub mod consumer;
pub mod obtainer;
pub mod parser;
pub mod quote;
pub mod spsc;
pub mod transport;
pub mod view;

pub use book::{OrderBook, PriceLevel};
pub use config::{ConsumerConfig, FixSessionConfig, VenueConfig};
pub use consumer::{ObtainerQueueStats, QuoteConsumer};
pub use obtainer::{ObtainerStatsSnapshot, QuoteObtainer};
pub use quote::{Quote, Side, Symbol};
pub use transport::{FeedTransport, FixFeedClient, Transport, TransportKind, WsFeedClient};
pub use view::{BookView, OrderBookSnapshot, SnapshotReader};
