//! Double-buffered snapshot view: wait-free publish, lock-free reads.
//!
//! Two snapshot slots and one atomic index. The single writer (the consumer
//! worker) fills the inactive slot and flips the index with a release store;
//! readers acquire the index and copy the active slot out by value. The
//! writer never touches the slot the index currently points at, and the
//! release/acquire pair on the index synchronises the slot contents.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use serde::Serialize;

/// Process-relative monotonic nanosecond timestamp.
#[inline]
pub fn mono_now_ns() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Value copy of an order book, truncated to a per-side level cap.
///
/// `best_bid`/`best_ask` are NaN when the corresponding side is empty.
/// Never mutated after publish; every reader gets an independent copy.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_levels: Vec<(f64, f64)>,
    pub ask_levels: Vec<(f64, f64)>,
    /// Monotonic instant of publication, nanoseconds since process start.
    pub mono_ns: u64,
}

impl Default for OrderBookSnapshot {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            best_bid: f64::NAN,
            best_ask: f64::NAN,
            bid_levels: Vec::new(),
            ask_levels: Vec::new(),
            mono_ns: 0,
        }
    }
}

impl OrderBookSnapshot {
    /// Size-weighted midpoint of the top of book, NaN when either side is
    /// missing or top-of-book sizes are absent.
    pub fn microprice(&self) -> f64 {
        match (self.bid_levels.first(), self.ask_levels.first()) {
            (Some(&(bb, sb)), Some(&(ba, sa))) if sb + sa > 0.0 => {
                (bb * sa + ba * sb) / (sb + sa)
            }
            _ => f64::NAN,
        }
    }
}

/// The two-slot view. Exactly one slot is active at any instant; writers only
/// touch the inactive slot before publishing.
pub struct BookView {
    slots: [CachePadded<UnsafeCell<OrderBookSnapshot>>; 2],
    active: CachePadded<AtomicUsize>,
}

// SAFETY: the publish protocol guarantees the writer and any reader never
// access the same slot concurrently (single writer, release/acquire index).
unsafe impl Sync for BookView {}
unsafe impl Send for BookView {}

impl BookView {
    pub fn new() -> Self {
        Self {
            slots: [
                CachePadded::new(UnsafeCell::new(OrderBookSnapshot::default())),
                CachePadded::new(UnsafeCell::new(OrderBookSnapshot::default())),
            ],
            active: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Publish a fresh snapshot.
    ///
    /// SAFETY contract: single writer only (the consumer worker thread).
    pub fn publish(&self, snapshot: OrderBookSnapshot) {
        let cur = self.active.load(Ordering::Relaxed);
        let next = 1 - cur;
        // SAFETY: `next` is the inactive slot; no reader dereferences it
        // until the release store below makes it active.
        unsafe {
            *self.slots[next].get() = snapshot;
        }
        self.active.store(next, Ordering::Release);
    }

    /// Copy out the latest published snapshot. Callable from any thread.
    pub fn read(&self) -> OrderBookSnapshot {
        let idx = self.active.load(Ordering::Acquire);
        // SAFETY: the acquire load pairs with the writer's release store;
        // the active slot is fully constructed and not being written.
        unsafe { (*self.slots[idx].get()).clone() }
    }
}

impl Default for BookView {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap cloneable read handle handed to visualisers and strategy consumers.
#[derive(Clone)]
pub struct SnapshotReader {
    view: Arc<BookView>,
}

impl SnapshotReader {
    pub fn new(view: Arc<BookView>) -> Self {
        Self { view }
    }

    /// Latest snapshot, by value.
    #[inline]
    pub fn read(&self) -> OrderBookSnapshot {
        self.view.read()
    }
}
