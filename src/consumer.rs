//! Quote consumer: drains obtainer queues into one aggregated book and
//! publishes snapshots.
//!
//! One worker thread per consumer. Each iteration drains every source's bid
//! queue then its ask queue, folds the quotes into the book, and publishes a
//! snapshot immediately when the top of book moved, otherwise coalesced on a
//! timer so depth-only churn does not rebuild snapshots at wire rate. Idle
//! iterations park for 100 µs.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::book::OrderBook;
use crate::config::ConsumerConfig;
use crate::obtainer::{ObtainerCore, QuoteObtainer};
use crate::quote::Quote;
use crate::spsc::Consumer;
use crate::view::{mono_now_ns, BookView, SnapshotReader};

/// Idle park between empty drain passes.
const IDLE_PARK: Duration = Duration::from_micros(100);

/// Queue occupancy per source, for operator surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ObtainerQueueStats {
    pub source: String,
    pub bid_queue_len: usize,
    pub ask_queue_len: usize,
}

struct Source {
    id: String,
    core: Arc<ObtainerCore>,
    bid_rx: Consumer<Quote>,
    ask_rx: Consumer<Quote>,
}

struct ConsumerInner {
    symbol: String,
    sources: Mutex<Vec<Source>>,
    book: Mutex<OrderBook>,
    view: Mutex<Option<Arc<BookView>>>,
    publish_levels: AtomicUsize,
    publish_period_us: AtomicU64,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Aggregates one or more obtainers for a single symbol.
pub struct QuoteConsumer {
    inner: Arc<ConsumerInner>,
}

impl QuoteConsumer {
    pub fn new(symbol: impl Into<String>, config: ConsumerConfig) -> Self {
        let symbol = symbol.into();
        Self {
            inner: Arc::new(ConsumerInner {
                book: Mutex::new(OrderBook::new(symbol.clone())),
                symbol,
                sources: Mutex::new(Vec::new()),
                view: Mutex::new(None),
                publish_levels: AtomicUsize::new(config.publish_levels),
                publish_period_us: AtomicU64::new(config.publish_period.as_micros() as u64),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Wire an obtainer into this consumer, taking exclusive ownership of its
    /// queues. Returns `false` when the queues were already claimed.
    pub fn add_obtainer(&self, obtainer: &mut QuoteObtainer) -> bool {
        let (Some(bid_rx), Some(ask_rx)) = (obtainer.take_bid_queue(), obtainer.take_ask_queue())
        else {
            warn!(
                source = %obtainer.source_id(),
                "obtainer queues already claimed by another consumer"
            );
            return false;
        };
        self.inner.sources.lock().push(Source {
            id: obtainer.source_id(),
            core: obtainer.core(),
            bid_rx,
            ask_rx,
        });
        true
    }

    /// Attach the snapshot view the worker publishes into.
    pub fn attach_view(&self, view: Arc<BookView>) {
        *self.inner.view.lock() = Some(view);
    }

    /// Read handle over the attached view, if any.
    pub fn reader(&self) -> Option<SnapshotReader> {
        self.inner
            .view
            .lock()
            .as_ref()
            .map(|v| SnapshotReader::new(Arc::clone(v)))
    }

    pub fn set_publish_levels(&self, levels: usize) {
        self.inner.publish_levels.store(levels, Ordering::Relaxed);
    }

    pub fn set_publish_period(&self, period: Duration) {
        self.inner
            .publish_period_us
            .store(period.as_micros() as u64, Ordering::Relaxed);
    }

    /// Connect every obtainer and spawn the worker. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!(symbol = %self.inner.symbol, "consumer already running");
            return;
        }

        {
            let sources = self.inner.sources.lock();
            for src in sources.iter() {
                if !src.core.connect() {
                    // The obtainer's error path schedules its own reconnects.
                    warn!(source = %src.id, "initial connect failed");
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("consumer-{}", self.inner.symbol))
            .spawn(move || worker_loop(inner));

        match spawned {
            Ok(handle) => {
                *self.inner.worker.lock() = Some(handle);
                info!(symbol = %self.inner.symbol, "consumer started");
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                error!(error = %e, "failed to spawn consumer worker");
            }
        }
    }

    /// Stop the worker and disconnect every obtainer. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        let sources = self.inner.sources.lock();
        for src in sources.iter() {
            src.core.disconnect();
        }
        info!(symbol = %self.inner.symbol, "consumer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    /// Direct book access; test and diagnostics surface, not the hot path.
    pub fn order_book(&self) -> MutexGuard<'_, OrderBook> {
        self.inner.book.lock()
    }

    /// Queue occupancy per wired source.
    pub fn fetch_obtainer_stats(&self) -> Vec<ObtainerQueueStats> {
        self.inner
            .sources
            .lock()
            .iter()
            .map(|src| ObtainerQueueStats {
                source: src.id.clone(),
                bid_queue_len: src.bid_rx.len(),
                ask_queue_len: src.ask_rx.len(),
            })
            .collect()
    }
}

impl Drop for QuoteConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Top-of-book inequality where NaN only differs from a number, not itself.
#[inline]
fn tob_ne(a: f64, b: f64) -> bool {
    a != b && !(a.is_nan() && b.is_nan())
}

fn worker_loop(inner: Arc<ConsumerInner>) {
    let mut last_bb = f64::NAN;
    let mut last_ba = f64::NAN;
    let mut since_publish: u64 = 0;
    let mut next_publish = Instant::now();

    while inner.running.load(Ordering::Acquire) {
        let mut did_work = false;

        {
            let sources = inner.sources.lock();
            let mut book = inner.book.lock();

            for src in sources.iter() {
                while let Some(quote) = src.bid_rx.pop() {
                    book.update(&quote);
                    since_publish += 1;
                    did_work = true;
                }
                while let Some(quote) = src.ask_rx.pop() {
                    book.update(&quote);
                    since_publish += 1;
                    did_work = true;
                }
            }

            let bb = book.best_bid();
            let ba = book.best_ask();
            let now = Instant::now();
            let tob_changed = tob_ne(bb, last_bb) || tob_ne(ba, last_ba);
            let time_to_publish = now >= next_publish && since_publish > 0;

            if tob_changed || time_to_publish {
                let view = inner.view.lock().clone();
                if let Some(view) = view {
                    let levels = inner.publish_levels.load(Ordering::Relaxed);
                    view.publish(book.snapshot(levels, mono_now_ns()));
                    since_publish = 0;
                    next_publish = now
                        + Duration::from_micros(inner.publish_period_us.load(Ordering::Relaxed));
                    last_bb = bb;
                    last_ba = ba;
                }
            }
        }

        if !did_work {
            std::thread::sleep(IDLE_PARK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueConfig;

    /// Loopback discard port: connects fail fast and reconnects are disabled
    /// so tests exercise the pipeline without a live venue.
    fn test_venue(market: &str) -> VenueConfig {
        VenueConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            market: market.to_string(),
            connect_timeout: Duration::from_millis(200),
            max_reconnect_attempts: 0,
        }
    }

    fn ws_obtainer(market: &str) -> QuoteObtainer {
        QuoteObtainer::websocket(test_venue(market))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_bid_and_ask_flow() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        assert!(consumer.add_obtainer(&mut obt));
        consumer.start();

        obt.ingest(br#"{"event":"book","bids":[["10420.00","0.75"]]}"#);
        obt.ingest(br#"{"event":"book","asks":[["10425.00","1.00"]]}"#);

        assert!(wait_until(Duration::from_secs(1), || {
            let book = consumer.order_book();
            book.best_bid() == 10420.00 && book.best_ask() == 10425.00
        }));

        consumer.stop();
    }

    #[test]
    fn test_handles_empty_feeds_gracefully() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);
        consumer.start();
        std::thread::sleep(Duration::from_millis(10));
        consumer.stop();

        assert_eq!(consumer.order_book().best_bid(), 0.0);
        assert_eq!(consumer.order_book().best_ask(), 0.0);
    }

    #[test]
    fn test_duplicate_levels_across_feeds_aggregate() {
        let mut feed_a = ws_obtainer("BTC-EUR");
        let mut feed_b = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut feed_a);
        consumer.add_obtainer(&mut feed_b);
        consumer.start();

        feed_a.ingest(br#"{"event":"book","bids":[["10420.00","0.75"]]}"#);
        feed_b.ingest(br#"{"event":"book","bids":[["10420.00","1.00"]]}"#);

        assert!(wait_until(Duration::from_secs(1), || {
            consumer.order_book().best_bid() == 10420.00
        }));
        // Same-price updates are last-write-wins in the aggregated book.
        assert_eq!(consumer.order_book().bid_depth(), 1);

        consumer.stop();
    }

    #[test]
    fn test_repeated_zero_size_deletions_safe() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);
        consumer.start();

        obt.ingest(br#"{"event":"book","bids":[["10400.00","0.5"]]}"#);
        assert!(wait_until(Duration::from_secs(1), || {
            consumer.order_book().best_bid() == 10400.00
        }));

        obt.ingest(br#"{"event":"book","bids":[["10400.00","0.0"]]}"#);
        obt.ingest(br#"{"event":"book","bids":[["10400.00","0.0"]]}"#);
        assert!(wait_until(Duration::from_secs(1), || {
            consumer.order_book().best_bid() == 0.0
        }));

        consumer.stop();
    }

    #[test]
    fn test_ignores_malformed_messages() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);
        consumer.start();

        obt.ingest(br#"{"event":"book","bids":[["bad_number","0.1"]]}"#);
        obt.ingest(br#"{"event":"book","asks":"oops"}"#);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.order_book().best_bid(), 0.0);
        assert_eq!(consumer.order_book().best_ask(), 0.0);

        consumer.stop();
    }

    #[test]
    fn test_processes_thousand_quotes_under_load() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);

        for i in 0..1000 {
            let price = 10_000.0 + i as f64 * 0.01;
            let size = (i % 10) as f64 * 0.1 + 0.1;
            let frame = format!(r#"{{"event":"book","bids":[["{price:.2}","{size:.2}"]]}}"#);
            obt.ingest(frame.as_bytes());
        }

        consumer.start();
        assert!(wait_until(Duration::from_secs(2), || {
            consumer
                .fetch_obtainer_stats()
                .iter()
                .all(|s| s.bid_queue_len == 0)
        }));

        let book = consumer.order_book();
        assert!((book.best_bid() - (10_000.0 + 999.0 * 0.01)).abs() < 1e-9);
        assert!(book.bid_depth() > 500);
        drop(book);

        consumer.stop();
    }

    #[test]
    fn test_stop_during_heavy_load_is_safe() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);
        consumer.start();

        for _ in 0..500 {
            obt.ingest(br#"{"event":"book","bids":[["101.00","0.1"]]}"#);
        }

        consumer.stop();
    }

    #[test]
    fn test_snapshot_published_on_tob_change() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);

        let view = Arc::new(BookView::new());
        consumer.attach_view(Arc::clone(&view));
        let reader = consumer.reader().unwrap();
        consumer.start();

        obt.ingest(br#"{"event":"book","bids":[["101.23","0.10"]]}"#);

        assert!(wait_until(Duration::from_secs(1), || {
            reader.read().best_bid == 101.23
        }));
        let snap = reader.read();
        assert_eq!(snap.symbol, "BTC-EUR");
        assert!(snap.best_ask.is_nan());
        assert_eq!(snap.bid_levels, vec![(101.23, 0.10)]);
        assert!(snap.mono_ns > 0);

        consumer.stop();
    }

    #[test]
    fn test_publish_levels_truncate_snapshots() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);
        consumer.set_publish_levels(2);
        consumer.set_publish_period(Duration::from_millis(5));

        let view = Arc::new(BookView::new());
        consumer.attach_view(Arc::clone(&view));
        consumer.start();

        for i in 0..5 {
            let frame = format!(
                r#"{{"event":"book","bids":[["{:.2}","1.0"]]}}"#,
                100.0 + i as f64
            );
            obt.ingest(frame.as_bytes());
        }

        assert!(wait_until(Duration::from_secs(1), || {
            view.read().best_bid == 104.0
        }));
        let snap = view.read();
        assert_eq!(snap.bid_levels.len(), 2);
        assert_eq!(snap.bid_levels[0], (104.0, 1.0));

        consumer.stop();
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let mut obt = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut obt);

        consumer.start();
        consumer.start();
        assert!(consumer.is_running());
        consumer.stop();
        consumer.stop();
        assert!(!consumer.is_running());
    }

    #[test]
    fn test_fetch_obtainer_stats_lists_sources() {
        let mut feed_a = ws_obtainer("BTC-EUR");
        let mut feed_b = ws_obtainer("BTC-EUR");
        let consumer = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        consumer.add_obtainer(&mut feed_a);
        consumer.add_obtainer(&mut feed_b);

        feed_a.ingest(br#"{"event":"book","bids":[["101.00","1.0"]]}"#);

        let stats = consumer.fetch_obtainer_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].source, "127.0.0.1:9");
        assert_eq!(stats[0].bid_queue_len, 1);
        assert_eq!(stats[1].bid_queue_len, 0);
    }

    #[test]
    fn test_obtainer_queues_claimed_once() {
        let mut obt = ws_obtainer("BTC-EUR");
        let first = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        let second = QuoteConsumer::new("BTC-EUR", ConsumerConfig::default());
        assert!(first.add_obtainer(&mut obt));
        assert!(!second.add_obtainer(&mut obt));
    }
}
