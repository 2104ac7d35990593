// ===============================
// src/orderbook.rs
// ===============================
//
// Sequence-validated L2 replica per symbol.
//
// - bids keyed descending (Reverse<Decimal>), asks ascending, both BTreeMap:
//   top-of-book and upserts are O(log n)
// - deltas with sequence <= last applied are dropped as stale
// - a sequence jump (when contiguity is guaranteed) or a crossed book marks
//   the replica stale; it ignores deltas until the next snapshot arrives
// - one writer (`BookWriter`, owned by the public-stream task); readers go
//   through `SharedBook` read locks
//
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::domain::{BookFrame, MdTick, PriceLevel};
use crate::metrics::BOOK_RESYNCS;
use crate::stream::StreamCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// sequence <= last applied; nothing changed
    Stale,
    /// non-contiguous jump; replica is now stale until re-snapshotted
    Gap { expected: u64, got: u64 },
    /// delta left best bid >= best ask; replica is now stale
    Crossed,
    /// no snapshot yet, or waiting for a fresh one after a gap
    AwaitingSnapshot,
}

impl ApplyOutcome {
    pub fn needs_resync(&self) -> bool {
        matches!(self, ApplyOutcome::Gap { .. } | ApplyOutcome::Crossed)
    }
}

/// Top `n` levels per side, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDepth {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct OrderBookReplica {
    symbol: String,
    bids: BTreeMap<Reverse<Decimal>, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    last_seq: Option<u64>,
    stale: bool,
    contiguous: bool,
}

impl OrderBookReplica {
    /// `contiguous`: the venue promises each delta's sequence is exactly
    /// previous + 1.
    pub fn new(symbol: &str, contiguous: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: None,
            stale: true,
            contiguous,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_seq
    }

    /// True until the first snapshot and after any gap.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn apply_snapshot(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], sequence: u64, ts_ms: i64) {
        self.bids.clear();
        self.asks.clear();
        for &(price, qty) in bids.iter().filter(|(_, q)| *q > Decimal::ZERO) {
            self.bids.insert(Reverse(price), PriceLevel { price, qty, updated_ms: ts_ms });
        }
        for &(price, qty) in asks.iter().filter(|(_, q)| *q > Decimal::ZERO) {
            self.asks.insert(price, PriceLevel { price, qty, updated_ms: ts_ms });
        }
        // a snapshot may legitimately restart numbering (venue restart)
        self.last_seq = Some(sequence);
        self.stale = false;
    }

    pub fn apply_delta(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], sequence: u64, ts_ms: i64) -> ApplyOutcome {
        let Some(last) = self.last_seq else {
            return ApplyOutcome::AwaitingSnapshot;
        };
        if sequence <= last {
            return ApplyOutcome::Stale;
        }
        if self.stale {
            return ApplyOutcome::AwaitingSnapshot;
        }
        if self.contiguous && sequence != last + 1 {
            self.stale = true;
            return ApplyOutcome::Gap { expected: last + 1, got: sequence };
        }
        for &(price, qty) in bids {
            if qty.is_zero() {
                self.bids.remove(&Reverse(price));
            } else {
                self.bids.insert(Reverse(price), PriceLevel { price, qty, updated_ms: ts_ms });
            }
        }
        for &(price, qty) in asks {
            if qty.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, PriceLevel { price, qty, updated_ms: ts_ms });
            }
        }
        self.last_seq = Some(sequence);
        if let (Some(b), Some(a)) = self.best_bid_ask() {
            if b.price >= a.price {
                self.stale = true;
                return ApplyOutcome::Crossed;
            }
        }
        ApplyOutcome::Applied
    }

    pub fn best_bid_ask(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        (self.bids.values().next().copied(), self.asks.values().next().copied())
    }

    pub fn mid(&self) -> Option<Decimal> {
        match self.best_bid_ask() {
            (Some(b), Some(a)) => Some((b.price + a.price) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn depth(&self, n: usize) -> BookDepth {
        BookDepth {
            symbol: self.symbol.clone(),
            bids: self.bids.values().take(n).copied().collect(),
            asks: self.asks.values().take(n).copied().collect(),
            sequence: self.last_seq.unwrap_or(0),
        }
    }
}

/// Reader/writer handle to one replica.
#[derive(Debug, Clone)]
pub struct SharedBook(Arc<RwLock<OrderBookReplica>>);

impl SharedBook {
    pub fn new(symbol: &str, contiguous: bool) -> Self {
        SharedBook(Arc::new(RwLock::new(OrderBookReplica::new(symbol, contiguous))))
    }

    // readers never observe a half-applied frame, so a poisoned lock still
    // guards a consistent replica
    pub fn read(&self) -> RwLockReadGuard<'_, OrderBookReplica> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, OrderBookReplica> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Book topic name for a symbol at the subscribed depth.
pub fn book_topic(depth: u32, symbol: &str) -> String {
    format!("orderbook.{depth}.{symbol}")
}

/// Single write path for every replica. Publishes top-of-book after each
/// applied frame and asks the public stream for a fresh snapshot on a gap.
pub struct BookWriter {
    books: HashMap<String, SharedBook>,
    depth: u32,
    md_tx: broadcast::Sender<MdTick>,
    resync_tx: mpsc::Sender<StreamCommand>,
}

impl BookWriter {
    pub fn new(books: HashMap<String, SharedBook>, depth: u32, md_tx: broadcast::Sender<MdTick>, resync_tx: mpsc::Sender<StreamCommand>) -> Self {
        Self { books, depth, md_tx, resync_tx }
    }

    pub fn on_snapshot(&self, frame: &BookFrame) {
        let Some(book) = self.books.get(&frame.symbol) else {
            debug!(symbol = %frame.symbol, "snapshot for untracked symbol");
            return;
        };
        let top = {
            let mut b = book.write();
            b.apply_snapshot(&frame.bids, &frame.asks, frame.sequence, frame.ts_ms);
            b.best_bid_ask()
        };
        debug!(symbol = %frame.symbol, seq = frame.sequence, "book snapshot applied");
        self.publish(&frame.symbol, frame.ts_ms, top);
    }

    /// REST seed: only used while the stream has not delivered a snapshot.
    pub fn seed(&self, frame: &BookFrame) {
        let needs = self.books.get(&frame.symbol).map(|b| b.read().last_sequence().is_none()).unwrap_or(false);
        if needs {
            info!(symbol = %frame.symbol, seq = frame.sequence, "book seeded from REST snapshot");
            self.on_snapshot(frame);
        }
    }

    pub async fn on_delta(&self, frame: &BookFrame) -> ApplyOutcome {
        let Some(book) = self.books.get(&frame.symbol) else {
            return ApplyOutcome::AwaitingSnapshot;
        };
        let (outcome, top) = {
            let mut b = book.write();
            let o = b.apply_delta(&frame.bids, &frame.asks, frame.sequence, frame.ts_ms);
            (o, b.best_bid_ask())
        };
        match outcome {
            ApplyOutcome::Applied => self.publish(&frame.symbol, frame.ts_ms, top),
            ApplyOutcome::Stale => debug!(symbol = %frame.symbol, seq = frame.sequence, "stale delta dropped"),
            ApplyOutcome::AwaitingSnapshot => {}
            ApplyOutcome::Gap { expected, got } => {
                warn!(symbol = %frame.symbol, expected, got, "book sequence gap, resnapshotting");
            }
            ApplyOutcome::Crossed => warn!(symbol = %frame.symbol, seq = frame.sequence, "crossed book, resnapshotting"),
        }
        if outcome.needs_resync() {
            BOOK_RESYNCS.with_label_values(&[&frame.symbol]).inc();
            let topic = book_topic(self.depth, &frame.symbol);
            if self.resync_tx.send(StreamCommand::Resubscribe(topic)).await.is_err() {
                warn!(symbol = %frame.symbol, "public stream gone, cannot resnapshot");
            }
        }
        outcome
    }

    fn publish(&self, symbol: &str, ts_ms: i64, top: (Option<PriceLevel>, Option<PriceLevel>)) {
        let tick = MdTick {
            ts_ms,
            symbol: symbol.to_string(),
            best_bid: top.0.map(|l| l.price),
            best_ask: top.1.map(|l| l.price),
        };
        // no subscribers is fine
        let _ = self.md_tx.send(tick);
    }
}
