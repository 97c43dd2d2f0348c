//! Quote obtainer: one venue feed turned into two SPSC quote streams.
//!
//! Owns exactly one transport and the bid/ask rings. The venue parser is
//! installed as the transport's message handler at construction; transport
//! errors trigger disconnect plus a single-flight reconnect loop with
//! exponential backoff and jitter. Alongside the hot path it keeps peak
//! quotes and a small rolling window of arrival timestamps per side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::VenueConfig;
use crate::parser::{bitvavo, fix};
use crate::quote::{Quote, Side};
use crate::spsc::{self, Consumer, Producer};
use crate::transport::{FeedTransport, Transport, TransportKind};

/// Backoff schedule for the reconnect loop.
const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 3_000;
const JITTER_MS: u64 = 50;

/// Rolling arrival-timestamp window per side.
const INTERVAL_WINDOW: usize = 100;

/// Counters maintained off the hot path's critical loads.
#[derive(Debug, Default)]
pub struct ObtainerStats {
    pub quotes_ingested: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub queue_overflows: AtomicU64,
    pub transport_errors: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

impl ObtainerStats {
    pub fn snapshot(&self) -> ObtainerStatsSnapshot {
        ObtainerStatsSnapshot {
            quotes_ingested: self.quotes_ingested.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObtainerStatsSnapshot {
    pub quotes_ingested: u64,
    pub frames_rejected: u64,
    pub queue_overflows: u64,
    pub transport_errors: u64,
    pub reconnect_attempts: u64,
}

pub(crate) struct ObtainerCore {
    transport: Transport,
    config: VenueConfig,
    bid_tx: Producer<Quote>,
    ask_tx: Producer<Quote>,
    peak_bid: Mutex<Option<Quote>>,
    peak_ask: Mutex<Option<Quote>>,
    bid_times: Mutex<VecDeque<DateTime<Utc>>>,
    ask_times: Mutex<VecDeque<DateTime<Utc>>>,
    stats: ObtainerStats,
    reconnecting: AtomicBool,
}

impl ObtainerCore {
    /// Transport message callback: parse one frame, queue at most one quote.
    fn handle_frame(&self, frame: &[u8]) {
        let quote = match self.transport.kind() {
            TransportKind::WebSocket => bitvavo::parse_book_frame(frame, &self.config.market),
            TransportKind::Fix => fix::parse_record(frame),
        };
        match quote {
            Some(quote) => self.store_quote(quote),
            None => {
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                trace!(venue = %self.config.host, "frame yielded no quote");
            }
        }
    }

    fn store_quote(&self, quote: Quote) {
        match quote.side {
            Side::Bid => {
                if self.bid_tx.push(quote).is_err() {
                    self.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        venue = %self.config.host,
                        port = self.config.port,
                        "bid queue full, quote dropped"
                    );
                }
                {
                    let mut peak = self.peak_bid.lock();
                    if peak.map_or(true, |p| quote.price > p.price) {
                        *peak = Some(quote);
                    }
                }
                push_timestamp(&self.bid_times, quote.timestamp);
            }
            Side::Ask => {
                if self.ask_tx.push(quote).is_err() {
                    self.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        venue = %self.config.host,
                        port = self.config.port,
                        "ask queue full, quote dropped"
                    );
                }
                {
                    let mut peak = self.peak_ask.lock();
                    if peak.map_or(true, |p| quote.price < p.price) {
                        *peak = Some(quote);
                    }
                }
                push_timestamp(&self.ask_times, quote.timestamp);
            }
        }
        self.stats.quotes_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect(&self) -> bool {
        if !self
            .transport
            .connect(&self.config.host, self.config.port)
        {
            return false;
        }
        if self.transport.kind() == TransportKind::WebSocket {
            let payload = subscribe_payload(&self.config.market);
            if !self.transport.send(payload.as_bytes()) {
                warn!(market = %self.config.market, "book subscription send failed");
            }
        }
        true
    }

    pub(crate) fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub(crate) fn source_id(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn start_reconnect_loop(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let core = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("reconnect-{}", core.config.host))
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let max_attempts = core.config.max_reconnect_attempts;

                for attempt in 1..=max_attempts {
                    let backoff_ms =
                        (BASE_BACKOFF_MS << attempt.min(16)).min(MAX_BACKOFF_MS);
                    let jitter_ms = rng.gen_range(0..JITTER_MS);
                    std::thread::sleep(Duration::from_millis(backoff_ms + jitter_ms));

                    info!(
                        attempt,
                        max_attempts,
                        venue = %core.source_id(),
                        "reconnect attempt"
                    );
                    core.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

                    if core.connect() {
                        info!(venue = %core.source_id(), "reconnect succeeded");
                        core.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                }

                error!(
                    attempts = max_attempts,
                    venue = %core.source_id(),
                    "reconnect attempts exhausted, feed stays down"
                );
                core.reconnecting.store(false, Ordering::Release);
            });

        // The reconnect thread is detached; a shutdown racing a late connect
        // is resolved by the destructor closing the transport.
        match spawned {
            Ok(handle) => drop(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn reconnect thread");
                self.reconnecting.store(false, Ordering::Release);
            }
        }
    }
}

fn push_timestamp(times: &Mutex<VecDeque<DateTime<Utc>>>, ts: DateTime<Utc>) {
    let mut times = times.lock();
    times.push_back(ts);
    if times.len() > INTERVAL_WINDOW {
        times.pop_front();
    }
}

fn avg_interval_ms(times: &VecDeque<DateTime<Utc>>) -> f64 {
    if times.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for pair in times.iter().zip(times.iter().skip(1)) {
        total += (*pair.1 - *pair.0).num_milliseconds() as f64;
    }
    total / (times.len() - 1) as f64
}

fn subscribe_payload(market: &str) -> String {
    format!(r#"{{"action":"subscribe","channels":[{{"name":"book","markets":["{market}"]}}]}}"#)
}

/// A venue feed: transport, parser and queues wired together.
pub struct QuoteObtainer {
    core: Arc<ObtainerCore>,
    bid_rx: Option<Consumer<Quote>>,
    ask_rx: Option<Consumer<Quote>>,
}

impl QuoteObtainer {
    /// Build a websocket-fed obtainer for `config.market`.
    pub fn websocket(config: VenueConfig) -> Self {
        let transport = Transport::WebSocket(crate::transport::WsFeedClient::new(
            config.connect_timeout,
        ));
        Self::new(transport, config)
    }

    /// Build a FIX/TCP-fed obtainer for `config.market`.
    pub fn fix(config: VenueConfig, session: crate::config::FixSessionConfig) -> Self {
        let transport = Transport::Fix(crate::transport::FixFeedClient::with_timeout(
            session,
            config.market.clone(),
            config.connect_timeout,
        ));
        Self::new(transport, config)
    }

    pub fn new(transport: Transport, config: VenueConfig) -> Self {
        let (bid_tx, bid_rx) = spsc::ring();
        let (ask_tx, ask_rx) = spsc::ring();

        let core = Arc::new(ObtainerCore {
            transport,
            config,
            bid_tx,
            ask_tx,
            peak_bid: Mutex::new(None),
            peak_ask: Mutex::new(None),
            bid_times: Mutex::new(VecDeque::with_capacity(INTERVAL_WINDOW + 1)),
            ask_times: Mutex::new(VecDeque::with_capacity(INTERVAL_WINDOW + 1)),
            stats: ObtainerStats::default(),
            reconnecting: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&core);
        core.transport.set_message_handler(Arc::new(move |frame| {
            if let Some(core) = weak.upgrade() {
                core.handle_frame(frame);
            }
        }));

        let weak = Arc::downgrade(&core);
        core.transport.set_error_handler(Arc::new(move |err| {
            if let Some(core) = weak.upgrade() {
                warn!(venue = %core.source_id(), error = err, "transport error");
                core.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                core.disconnect();
                core.start_reconnect_loop();
            }
        }));

        Self {
            core,
            bid_rx: Some(bid_rx),
            ask_rx: Some(ask_rx),
        }
    }

    /// Connect the transport; for websocket venues this also sends the book
    /// subscription.
    pub fn connect(&self) -> bool {
        self.core.connect()
    }

    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Receive side of the bid queue. Yields `None` on the second call; there
    /// is exactly one consumer.
    pub fn take_bid_queue(&mut self) -> Option<Consumer<Quote>> {
        self.bid_rx.take()
    }

    /// Receive side of the ask queue. Yields `None` on the second call.
    pub fn take_ask_queue(&mut self) -> Option<Consumer<Quote>> {
        self.ask_rx.take()
    }

    /// Feed one raw frame through the installed parser path, exactly as the
    /// transport's receive thread would. Used by tests and capture replay.
    pub fn ingest(&self, frame: &[u8]) {
        self.core.handle_frame(frame);
    }

    /// Highest-priced bid quote seen since start.
    pub fn peak_bid(&self) -> Option<Quote> {
        *self.core.peak_bid.lock()
    }

    /// Lowest-priced ask quote seen since start.
    pub fn peak_ask(&self) -> Option<Quote> {
        *self.core.peak_ask.lock()
    }

    /// Mean milliseconds between consecutive bid arrivals over the rolling
    /// window; 0.0 with fewer than two samples.
    pub fn avg_bid_interval_ms(&self) -> f64 {
        avg_interval_ms(&self.core.bid_times.lock())
    }

    pub fn avg_ask_interval_ms(&self) -> f64 {
        avg_interval_ms(&self.core.ask_times.lock())
    }

    pub fn stats(&self) -> ObtainerStatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn market(&self) -> &str {
        &self.core.config.market
    }

    pub fn source_id(&self) -> String {
        self.core.source_id()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.core.reconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn core(&self) -> Arc<ObtainerCore> {
        Arc::clone(&self.core)
    }
}

impl Drop for QuoteObtainer {
    fn drop(&mut self) {
        debug!(venue = %self.source_id(), "obtainer dropped, closing transport");
        self.core.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spsc::QUEUE_CAPACITY;

    fn ws_obtainer(market: &str) -> QuoteObtainer {
        QuoteObtainer::websocket(VenueConfig {
            market: market.to_string(),
            ..VenueConfig::default()
        })
    }

    fn fix_obtainer(market: &str) -> QuoteObtainer {
        QuoteObtainer::fix(
            VenueConfig {
                host: "fix.example.test".to_string(),
                port: 9880,
                market: market.to_string(),
                ..VenueConfig::default()
            },
            crate::config::FixSessionConfig::default(),
        )
    }

    #[test]
    fn test_ws_bid_frame_lands_in_bid_queue() {
        let mut obt = ws_obtainer("BTC-EUR");
        obt.ingest(br#"{"event":"book","bids":[["101.23","0.10"]]}"#);

        let bid_rx = obt.take_bid_queue().unwrap();
        let q = bid_rx.pop().unwrap();
        assert_eq!(q.side, Side::Bid);
        assert_eq!(q.price, 101.23);
        assert_eq!(q.size, 0.10);
        assert_eq!(q.symbol.as_str(), "BTC-EUR");
        assert!(bid_rx.pop().is_none());
    }

    #[test]
    fn test_ws_ask_frame_lands_in_ask_queue() {
        let mut obt = ws_obtainer("BTC-EUR");
        obt.ingest(br#"{"event":"book","asks":[["101.50","0.25"]]}"#);

        let ask_rx = obt.take_ask_queue().unwrap();
        let q = ask_rx.pop().unwrap();
        assert_eq!(q.side, Side::Ask);
        assert_eq!(q.price, 101.50);
        assert_eq!(q.size, 0.25);

        let bid_rx = obt.take_bid_queue().unwrap();
        assert!(bid_rx.pop().is_none());
    }

    #[test]
    fn test_fix_record_routes_through_fix_parser() {
        let obt = fix_obtainer("ETH-EUR");
        obt.ingest(b"35=W\x0155=ETH-EUR\x01268=1\x01269=0\x01270=1999.95\x01271=3.25\x01");

        let mut obt = obt;
        let bid_rx = obt.take_bid_queue().unwrap();
        let q = bid_rx.pop().unwrap();
        assert_eq!(q.price, 1999.95);
        assert_eq!(q.size, 3.25);
        assert_eq!(q.symbol.as_str(), "ETH-EUR");
    }

    #[test]
    fn test_rejected_frames_are_counted_not_queued() {
        let mut obt = ws_obtainer("BTC-EUR");
        obt.ingest(br#"{"event":"trade","bids":[["101.0","2.0"]]}"#);
        obt.ingest(br#"{"event":"book","bids":[["bad_number","0.1"]]}"#);

        assert_eq!(obt.stats().frames_rejected, 2);
        assert_eq!(obt.stats().quotes_ingested, 0);
        assert!(obt.take_bid_queue().unwrap().pop().is_none());
    }

    #[test]
    fn test_queue_overflow_drops_but_stays_live() {
        let obt = ws_obtainer("BTC-EUR");
        let extra = 76;
        for i in 0..(QUEUE_CAPACITY + extra) {
            let frame = format!(
                r#"{{"event":"book","bids":[["{:.2}","1.0"]]}}"#,
                10_000.0 + i as f64 * 0.01
            );
            obt.ingest(frame.as_bytes());
        }

        let stats = obt.stats();
        assert_eq!(stats.queue_overflows, extra as u64);
        assert_eq!(
            stats.quotes_ingested,
            (QUEUE_CAPACITY + extra) as u64
        );

        let mut obt = obt;
        let bid_rx = obt.take_bid_queue().unwrap();
        assert_eq!(bid_rx.len(), QUEUE_CAPACITY);
        // The oldest quote survived; overflow dropped the newest.
        assert_eq!(bid_rx.pop().unwrap().price, 10_000.0);
    }

    #[test]
    fn test_peak_tracking() {
        let obt = ws_obtainer("BTC-EUR");
        obt.ingest(br#"{"event":"book","bids":[["101.00","1.0"]]}"#);
        obt.ingest(br#"{"event":"book","bids":[["105.00","1.0"]]}"#);
        obt.ingest(br#"{"event":"book","bids":[["103.00","1.0"]]}"#);
        obt.ingest(br#"{"event":"book","asks":[["110.00","1.0"]]}"#);
        obt.ingest(br#"{"event":"book","asks":[["108.00","1.0"]]}"#);
        obt.ingest(br#"{"event":"book","asks":[["112.00","1.0"]]}"#);

        assert_eq!(obt.peak_bid().unwrap().price, 105.0);
        assert_eq!(obt.peak_ask().unwrap().price, 108.0);
    }

    #[test]
    fn test_avg_interval_requires_two_samples() {
        let obt = ws_obtainer("BTC-EUR");
        assert_eq!(obt.avg_bid_interval_ms(), 0.0);
        obt.ingest(br#"{"event":"book","bids":[["101.00","1.0"]]}"#);
        assert_eq!(obt.avg_bid_interval_ms(), 0.0);
        obt.ingest(br#"{"event":"book","bids":[["101.00","1.0"]]}"#);
        assert!(obt.avg_bid_interval_ms() >= 0.0);
    }

    #[test]
    fn test_queues_can_only_be_taken_once() {
        let mut obt = ws_obtainer("BTC-EUR");
        assert!(obt.take_bid_queue().is_some());
        assert!(obt.take_bid_queue().is_none());
        assert!(obt.take_ask_queue().is_some());
        assert!(obt.take_ask_queue().is_none());
    }

    #[test]
    fn test_source_id_and_market() {
        let obt = ws_obtainer("BTC-EUR");
        assert_eq!(obt.source_id(), "ws.bitvavo.com:443");
        assert_eq!(obt.market(), "BTC-EUR");
        assert!(!obt.is_reconnecting());
    }
}
