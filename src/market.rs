// ===============================
// src/market.rs
// ===============================
//
// Read side of market data for collaborators (books, tickers, klines,
// wallet) and the public fan-out task, which owns the only `BookWriter`.
//
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{Kline, Ticker, WalletBalance};
use crate::orderbook::{ApplyOutcome, BookDepth, BookWriter, SharedBook};
use crate::rest::VenueApi;
use crate::shutdown::Shutdown;
use crate::wire::StreamEvent;

#[derive(Debug, Default)]
struct Caches {
    tickers: HashMap<String, Ticker>,
    klines: HashMap<String, Kline>,
    wallet: Vec<WalletBalance>,
}

#[derive(Debug, Clone)]
pub struct MarketView {
    books: HashMap<String, SharedBook>,
    caches: Arc<RwLock<Caches>>,
}

impl MarketView {
    pub fn new(symbols: &[String], contiguous: bool) -> Self {
        let books = symbols.iter().map(|s| (s.clone(), SharedBook::new(s, contiguous))).collect();
        Self { books, caches: Arc::new(RwLock::new(Caches::default())) }
    }

    /// Book handles for the writer; shares the replicas with this view.
    pub fn books(&self) -> HashMap<String, SharedBook> {
        self.books.clone()
    }

    /// Last traded price, falling back to the book mid.
    pub fn current_price(&self, symbol: &str) -> Option<Decimal> {
        let last = self.read().tickers.get(symbol).and_then(|t| t.last_price);
        last.or_else(|| {
            let book = self.books.get(symbol)?.read();
            if book.is_stale() {
                return None;
            }
            book.mid()
        })
    }

    pub fn book_depth(&self, symbol: &str, n: usize) -> Option<BookDepth> {
        self.books.get(symbol).map(|b| b.read().depth(n))
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.read().tickers.get(symbol).cloned()
    }

    pub fn latest_kline(&self, symbol: &str) -> Option<Kline> {
        self.read().klines.get(symbol).cloned()
    }

    pub fn wallet(&self) -> Vec<WalletBalance> {
        self.read().wallet.clone()
    }

    /// Ticker deltas only carry changed fields; merge into what we have.
    pub fn on_ticker(&self, t: Ticker) {
        let mut c = self.write();
        match c.tickers.get_mut(&t.symbol) {
            Some(cur) => cur.merge(&t),
            None => {
                c.tickers.insert(t.symbol.clone(), t);
            }
        }
    }

    /// Keeps the newest candle; an older start time never replaces it.
    pub fn on_kline(&self, k: Kline) {
        let mut c = self.write();
        let newer = c.klines.get(&k.symbol).map(|cur| k.start_ms >= cur.start_ms).unwrap_or(true);
        if newer {
            c.klines.insert(k.symbol.clone(), k);
        }
    }

    /// Wallet pushes may list a subset of coins.
    pub fn on_wallet(&self, balances: Vec<WalletBalance>) {
        let mut c = self.write();
        for b in balances {
            match c.wallet.iter_mut().find(|w| w.coin == b.coin) {
                Some(w) => *w = b,
                None => c.wallet.push(b),
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Caches> {
        self.caches.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Caches> {
        self.caches.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Seed replicas that still have no snapshot from the REST book.
async fn seed_missing(view: &MarketView, writer: &BookWriter, api: &dyn VenueApi, depth: u32) {
    for (symbol, book) in &view.books {
        if book.read().last_sequence().is_some() {
            continue;
        }
        match api.orderbook(symbol, depth).await {
            Ok(frame) => writer.seed(&frame),
            Err(e) => warn!(%symbol, err = %e, "REST book seed failed"),
        }
    }
}

/// Public stream consumer: book frames go through the writer in arrival
/// order, everything else into the caches.
pub async fn run_public(
    view: MarketView,
    writer: BookWriter,
    api: Arc<dyn VenueApi>,
    depth: u32,
    seed_after: Duration,
    mut rx: mpsc::Receiver<StreamEvent>,
    mut shutdown: Shutdown,
) {
    info!(symbols = view.books.len(), "market fan-out started");
    let seed = tokio::time::sleep(seed_after);
    tokio::pin!(seed);
    let mut seeded = false;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = &mut seed, if !seeded => {
                seeded = true;
                seed_missing(&view, &writer, api.as_ref(), depth).await;
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    StreamEvent::BookSnapshot(f) => writer.on_snapshot(&f),
                    StreamEvent::BookDelta(f) => {
                        if writer.on_delta(&f).await == ApplyOutcome::AwaitingSnapshot {
                            debug!(symbol = %f.symbol, "delta before snapshot dropped");
                        }
                    }
                    StreamEvent::Ticker(t) => view.on_ticker(t),
                    StreamEvent::Kline(k) => view.on_kline(k),
                    StreamEvent::Wallet(w) => view.on_wallet(w),
                    other => debug!(kind = other.kind(), "private event on public fan-out ignored"),
                }
            }
        }
    }
    info!("market fan-out stopped");
}
